//! Wavefront CLI - render the demo scene with the wavefront scheduler.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use wavefront::prelude::*;

/// Verbosity requested on the command line.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Verbosity {
    Quiet,
    Info,
    Debug,
    Trace,
}

impl Verbosity {
    fn directive(self) -> &'static str {
        match self {
            Self::Quiet => "error",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// Set up logging. With `WAVEFRONT_TRACE=1` spans are also written to
/// `trace.json` for chrome://tracing; keep the guard alive until exit.
fn init_tracing(verbosity: Verbosity) -> Option<tracing_chrome::FlushGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(verbosity.directive()));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(filter);

    if env::var("WAVEFRONT_TRACE").ok().as_deref() == Some("1") {
        let (chrome_layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
            .file("trace.json")
            .build();
        if tracing_subscriber::registry()
            .with(fmt_layer)
            .with(chrome_layer)
            .try_init()
            .is_err()
        {
            return None;
        }
        return Some(guard);
    }

    let _ = tracing_subscriber::registry().with(fmt_layer).try_init();
    None
}

fn main() {
    let args: Vec<String> = env::args().collect();

    // Parse global flags
    let mut verbosity = Verbosity::Info;
    let mut filtered_args: Vec<&str> = Vec::new();
    for arg in &args[1..] {
        match arg.as_str() {
            "-v" | "--verbose" => verbosity = Verbosity::Debug,
            "-vv" | "--trace" => verbosity = Verbosity::Trace,
            "-q" | "--quiet" => verbosity = Verbosity::Quiet,
            _ => filtered_args.push(arg),
        }
    }
    let _guard = init_tracing(verbosity);

    if filtered_args.is_empty() {
        print_help();
        return;
    }

    let result = match filtered_args[0] {
        "render" | "r" => RenderOptions::parse(&filtered_args[1..]).and_then(cmd_render),
        "config" | "c" => cmd_config(filtered_args.get(1).copied()),
        "version" | "-V" | "--version" => {
            println!(
                "wavefront {} (built {} {})",
                env!("CARGO_PKG_VERSION"),
                env!("WAVEFRONT_BUILD_DATE"),
                env!("WAVEFRONT_BUILD_TIME")
            );
            Ok(())
        }
        "help" | "h" | "-h" | "--help" => {
            print_help();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other);
            eprintln!();
            print_help();
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn print_help() {
    println!("wavefront - wavefront path tracing scheduler");
    println!();
    println!("USAGE:");
    println!("    wavefront-cli [OPTIONS] <COMMAND> [ARGS]");
    println!();
    println!("COMMANDS:");
    println!("    r, render [render options]    Render the demo scene to an image");
    println!("    c, config [file]              Print or write the default configuration");
    println!("    version                       Show version and build date");
    println!("    h, help                       Show this help");
    println!();
    println!("RENDER OPTIONS:");
    println!("    --width <n>          Image width (default 256)");
    println!("    --height <n>         Image height (default 256)");
    println!("    --samples <n>        Samples per pixel (default 64)");
    println!("    --pass-samples <n>   Samples per render pass (default 8)");
    println!("    --max-paths <n>      Path state pool capacity");
    println!("    --adaptive           Enable adaptive sampling");
    println!("    --no-megakernel      Never switch to the megakernel");
    println!("    --config <file>      Load configuration from JSON");
    println!("    --out <file>         Output image, .png/.exr/.hdr (default render.png)");
    println!();
    println!("OPTIONS:");
    println!("    -v, --verbose    Show debug output");
    println!("    -vv, --trace     Show trace output (very verbose)");
    println!("    -q, --quiet      Only show errors");
    println!();
    println!("ENVIRONMENT:");
    println!("    RUST_LOG           Overrides the verbosity flags");
    println!("    WAVEFRONT_TRACE=1  Write a chrome trace to trace.json");
}

struct RenderOptions {
    width: usize,
    height: usize,
    samples: u32,
    pass_samples: u32,
    max_paths: Option<usize>,
    adaptive: bool,
    no_megakernel: bool,
    config: Option<PathBuf>,
    out: PathBuf,
}

impl RenderOptions {
    fn parse(args: &[&str]) -> anyhow::Result<Self> {
        let mut opts = Self {
            width: 256,
            height: 256,
            samples: 64,
            pass_samples: 8,
            max_paths: None,
            adaptive: false,
            no_megakernel: false,
            config: None,
            out: PathBuf::from("render.png"),
        };

        let mut it = args.iter();
        while let Some(&arg) = it.next() {
            let mut value = || {
                it.next()
                    .copied()
                    .with_context(|| format!("missing value for {}", arg))
            };
            match arg {
                "--width" => opts.width = value()?.parse().context("--width")?,
                "--height" => opts.height = value()?.parse().context("--height")?,
                "--samples" => opts.samples = value()?.parse().context("--samples")?,
                "--pass-samples" => opts.pass_samples = value()?.parse().context("--pass-samples")?,
                "--max-paths" => opts.max_paths = Some(value()?.parse().context("--max-paths")?),
                "--config" => opts.config = Some(PathBuf::from(value()?)),
                "--out" | "-o" => opts.out = PathBuf::from(value()?),
                "--adaptive" => opts.adaptive = true,
                "--no-megakernel" => opts.no_megakernel = true,
                other => bail!("unknown render option '{}'", other),
            }
        }

        if opts.width == 0 || opts.height == 0 {
            bail!("image size must be non-zero");
        }
        if opts.samples == 0 || opts.pass_samples == 0 {
            bail!("sample counts must be non-zero");
        }
        Ok(opts)
    }

    fn config(&self) -> anyhow::Result<PathTraceConfig> {
        let mut config = match &self.config {
            Some(path) => {
                PathTraceConfig::load(path).with_context(|| format!("loading {}", path.display()))?
            }
            None => PathTraceConfig::default(),
        };
        if let Some(max_paths) = self.max_paths {
            config.max_num_paths = max_paths;
        }
        if self.adaptive {
            config.adaptive.enabled = true;
        }
        if self.no_megakernel {
            config.use_megakernel = false;
        }
        config.validate()?;
        Ok(config)
    }
}

fn cmd_render(opts: RenderOptions) -> anyhow::Result<()> {
    let config = opts.config()?;
    let adaptive = config.adaptive;

    let device = Arc::new(CpuDevice::new());
    device.set_scene(Scene::demo(opts.width, opts.height));
    tracing::info!(
        "Rendering {}x{} at {} spp on {} ({} path slots)",
        opts.width,
        opts.height,
        opts.samples,
        device.info().name,
        config.max_num_paths
    );

    let mut work = PathTraceWork::new(device.clone(), config, Arc::default())?;
    work.init_execution()?;
    work.set_effective_buffer_params(BufferParams::new(opts.width, opts.height))?;

    let mut display = HostDisplay::new(opts.width, opts.height);
    let start = Instant::now();
    let mut rendered = 0;
    while rendered < opts.samples {
        let num = opts.pass_samples.min(opts.samples - rendered);
        let pass_start = Instant::now();
        work.render_samples(rendered, num)?;
        rendered += num;
        tracing::debug!("Pass {}..{} took {:.2?}", rendered - num, rendered, pass_start.elapsed());

        work.copy_to_gpu_display(&mut display, 1.0 / rendered as f32)?;

        if adaptive.enabled && rendered >= adaptive.min_samples && work.adaptive_sampling_converge_and_filter(rendered)? {
            tracing::info!("All pixels converged after {} samples", rendered);
            break;
        }
    }

    let elapsed = start.elapsed();
    save_display(&display, &opts.out)?;

    let stats = work.stats();
    println!("Rendered {} samples in {:.2?}", rendered, elapsed);
    println!("  iterations:   {}", stats.num_iterations);
    println!("  work tiles:   {}", stats.num_tiles);
    println!("  camera paths: {}", stats.num_camera_paths);
    for kernel in DeviceKernel::ALL {
        let n = stats.launches(kernel);
        if n > 0 {
            println!("  {:<40} {}", kernel.name(), n);
        }
    }
    println!("Saved {}", opts.out.display());
    Ok(())
}

fn save_display(display: &HostDisplay, path: &Path) -> anyhow::Result<()> {
    display
        .save(path)
        .with_context(|| format!("saving {}", path.display()))
}

fn cmd_config(path: Option<&str>) -> anyhow::Result<()> {
    let config = PathTraceConfig::default();
    match path {
        Some(path) => {
            config.save(Path::new(path))?;
            println!("Wrote {}", path);
        }
        None => println!("{}", serde_json::to_string_pretty(&config)?),
    }
    Ok(())
}
