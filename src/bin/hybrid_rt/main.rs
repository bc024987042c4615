//! hybrid-rt CLI - Render the demo scene through the ray-query subsystem.

use std::env;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use hybrid_rt::device::{ResourceState, TextureDesc, TextureFormat, TextureId};
use hybrid_rt::frame::{frame_constants, FrameTargets};
use hybrid_rt::prelude::*;
use hybrid_rt::records::RecordLayout;
use hybrid_rt::technique::local_layout;

const SHADOW_MAP_SIZE: u32 = 1024;

fn main() {
    let args: Vec<String> = env::args().collect();

    // Parse global flags
    let mut level = "info";
    let mut filtered_args: Vec<&str> = Vec::new();
    for arg in &args[1..] {
        match arg.as_str() {
            "-v" | "--verbose" => level = "debug",
            "-vv" | "--trace" => level = "trace",
            "-q" | "--quiet" => level = "warn",
            _ => filtered_args.push(arg),
        }
    }
    let _guard = init_tracing(level);

    if filtered_args.is_empty() {
        print_usage(&args[0]);
        return;
    }

    let result = match filtered_args[0] {
        "info" | "i" => cmd_info(),
        "modes" | "m" => {
            cmd_modes();
            Ok(())
        }
        "render" | "r" => RenderArgs::parse(&filtered_args[1..]).and_then(cmd_render),
        "help" | "h" | "-h" | "--help" => {
            print_usage(&args[0]);
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage(&args[0]);
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn print_usage(prog: &str) {
    let date = option_env!("HYBRID_RT_BUILD_DATE").unwrap_or("unknown");
    println!("hybrid-rt {} ({}) - Ray-query subsystem demo", env!("CARGO_PKG_VERSION"), date);
    println!();
    println!("Usage: {} [options] <command> [args]", prog);
    println!();
    println!("Commands:");
    println!("  i, info    Show device caps, techniques and record layout");
    println!("  m, modes   List frame modes");
    println!("  r, render  Render the demo scene to EXR");
    println!("  h, help    Show this help");
    println!();
    println!("Render options:");
    println!("  --mode <name>        Frame mode (see `modes`)");
    println!("  --frames <n>         Frames to render (default 1)");
    println!("  --size <WxH>         Output resolution");
    println!("  --camera <index>     Camera index");
    println!("  --taa                Enable temporal accumulation");
    println!("  --settings <file>    Settings JSON (default: user config dir)");
    println!("  --out <file.exr>     Output image (default render.exr)");
    println!();
    println!("Options:");
    println!("  -v, --verbose  Debug output");
    println!("  -vv, --trace   Trace output (very verbose)");
    println!("  -q, --quiet    Warnings and errors only");
    println!();
    println!("Set HYBRID_RT_TRACE=1 to write a Chrome trace to trace.json");
}

fn init_tracing(level: &str) -> Option<tracing_chrome::FlushGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let fmt = tracing_subscriber::fmt::layer().with_target(false);
    let registry = tracing_subscriber::registry().with(filter).with(fmt);

    if std::env::var("HYBRID_RT_TRACE").ok().as_deref() != Some("1") {
        registry.try_init().ok();
        return None;
    }
    let (chrome_layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
        .file("trace.json")
        .build();
    registry.with(chrome_layer).try_init().ok()?;
    Some(guard)
}

fn cmd_info() -> anyhow::Result<()> {
    let device = SoftwareDevice::new();
    let caps = device.caps();
    println!("Device:              {}", caps.name);
    println!("Ray queries:         {}", caps.ray_queries);
    println!("Max recursion:       {}", caps.max_recursion_depth);
    println!("Identifier size:     {} bytes", caps.program_identifier_size);
    println!("Record alignment:    {} bytes", caps.record_alignment);
    println!("Memory budget:       {} MiB", caps.memory_budget / (1024 * 1024));
    println!();

    #[cfg(feature = "gpu")]
    {
        match hybrid_rt::device::wgpu_probe::probe_default_adapter() {
            Some(adapter) => {
                println!("GPU adapter:         {}", adapter.name);
                println!("GPU ray queries:     {}", adapter.ray_queries);
            }
            None => println!("GPU adapter:         none"),
        }
        println!();
    }

    let scene = demo::demo_scene()?;
    let subsystem = RaySubsystem::initialize(&device, &scene.meshes, &scene.materials, &builtin_library())?;
    println!("Objects:             {}", subsystem.geometry().len());
    println!("Instances:           {}", subsystem.index().instance_count());
    println!("Scratch:             {} bytes", subsystem.index().scratch_size());
    println!();

    let layout = RecordLayout::new(caps, &local_layout())?;
    println!(
        "Record layout:       table @{}, material @{}, stride {}",
        layout.descriptor_table_offset, layout.material_offset, layout.stride
    );
    println!();
    println!("{:<32} {:>8} {:>10}", "Technique", "Stack", "Table");
    for technique in subsystem.techniques().iter() {
        let table = subsystem.records().get(technique.id);
        println!(
            "{:<32} {:>8} {:>10}",
            technique.id.name(),
            technique.stack_size,
            table.byte_len()
        );
    }
    Ok(())
}

fn cmd_modes() {
    for mode in Mode::ALL {
        let route = mode.route();
        let technique = route.technique.map(|t| t.name()).unwrap_or("-");
        let mut flags = Vec::new();
        if route.reflections {
            flags.push("reflections");
        }
        if route.shadow_rays {
            flags.push("shadow rays");
        }
        println!("{:<22} {:<32} {}", mode.name(), technique, flags.join(", "));
    }
}

struct RenderArgs {
    mode: Option<Mode>,
    frames: u32,
    size: Option<(u32, u32)>,
    camera: Option<usize>,
    taa: bool,
    settings: Option<PathBuf>,
    out: PathBuf,
}

impl RenderArgs {
    fn parse(args: &[&str]) -> anyhow::Result<Self> {
        let mut parsed = Self {
            mode: None,
            frames: 1,
            size: None,
            camera: None,
            taa: false,
            settings: None,
            out: PathBuf::from("render.exr"),
        };
        let mut iter = args.iter();
        while let Some(&arg) = iter.next() {
            let mut value = || iter.next().copied().ok_or_else(|| anyhow!("{} needs a value", arg));
            match arg {
                "--mode" => parsed.mode = Some(value()?.parse().map_err(|e: String| anyhow!(e))?),
                "--frames" => parsed.frames = value()?.parse().context("--frames")?,
                "--size" => {
                    let v = value()?;
                    let (w, h) = v.split_once('x').ok_or_else(|| anyhow!("--size expects WxH, got {}", v))?;
                    parsed.size = Some((w.parse().context("width")?, h.parse().context("height")?));
                }
                "--camera" => parsed.camera = Some(value()?.parse().context("--camera")?),
                "--taa" => parsed.taa = true,
                "--settings" => parsed.settings = Some(PathBuf::from(value()?)),
                "--out" | "-o" => parsed.out = PathBuf::from(value()?),
                other => bail!("unknown render option {}", other),
            }
        }
        Ok(parsed)
    }
}

fn create_target(
    device: &SoftwareDevice,
    label: &str,
    size: (u32, u32),
    format: TextureFormat,
    state: ResourceState,
) -> anyhow::Result<TextureId> {
    Ok(device.create_texture(&TextureDesc::new(label, size.0, size.1, format, state))?)
}

fn cmd_render(args: RenderArgs) -> anyhow::Result<()> {
    let mut settings = match &args.settings {
        Some(path) => RenderSettings::load_from(path)?,
        None => RenderSettings::load(),
    };
    if let Some(mode) = args.mode {
        settings.mode = mode;
    }
    if let Some((w, h)) = args.size {
        settings.width = w;
        settings.height = h;
    }
    if let Some(camera) = args.camera {
        settings.camera_index = camera;
    }
    settings.temporal_aa |= args.taa;
    settings.clamp();
    let size = (settings.width, settings.height);

    let device = SoftwareDevice::new();
    let scene = demo::demo_scene()?;
    let subsystem = probe_and_initialize(&device, &scene.meshes, &scene.materials, &builtin_library())?;
    let mut dispatcher = FrameDispatcher::new(&device, subsystem, size)?;

    let targets = FrameTargets {
        color: create_target(&device, "color", size, TextureFormat::Rgba32Float, ResourceState::RenderTarget)?,
        depth: create_target(&device, "depth", size, TextureFormat::R32Float, ResourceState::DepthWrite)?,
        normal: create_target(&device, "normal", size, TextureFormat::Rgba32Float, ResourceState::RenderTarget)?,
        shadow_map: create_target(
            &device,
            "shadow_map",
            (SHADOW_MAP_SIZE, SHADOW_MAP_SIZE),
            TextureFormat::R32Float,
            ResourceState::DepthWrite,
        )?,
    };

    let start = std::time::Instant::now();
    for frame in 0..args.frames.max(1) {
        // Stand-ins for the rasterized depth prepass and shadow-map pass
        if let Some(subsystem) = dispatcher.subsystem() {
            let raster = subsystem.raster_scene();
            let mut state = *dispatcher.state();
            state.camera_index = settings.camera_index;
            state.resolution = size;
            let camera = scene.cameras.get(settings.camera_index)?;
            device.reference_prepass(&frame_constants(camera, &state), &raster, targets.depth, targets.normal)?;
            device.reference_shadow_pass(settings.light_view_proj(subsystem.geometry()), &raster, targets.shadow_map)?;
        }

        let mut list = CommandList::new(QueueKind::Graphics, format!("frame_{}", frame));
        let outcome = dispatcher.dispatch(&device, &mut list, &settings, &scene.cameras, &targets)?;
        if list.needs_rebind() {
            if let Some(subsystem) = dispatcher.subsystem() {
                list.set_descriptor_heap(subsystem.materials().heap);
            }
        }
        device.submit(list)?;
        settings.reset_history = false;
        tracing::debug!(frame, mode = %outcome.mode, weight = ?outcome.blend_weight, "frame submitted");
    }
    tracing::info!(
        frames = args.frames.max(1),
        elapsed_ms = start.elapsed().as_millis() as u64,
        mode = %dispatcher.state().mode,
        "render finished"
    );

    let texels = device.read_texture(targets.color)?;
    let raw: Vec<f32> = texels.iter().flat_map(|t| t.iter().copied()).collect();
    let image = image::Rgba32FImage::from_raw(size.0, size.1, raw)
        .ok_or_else(|| anyhow!("color target size mismatch"))?;
    image
        .save(&args.out)
        .with_context(|| format!("writing {}", args.out.display()))?;
    println!("Wrote {}", args.out.display());
    Ok(())
}
