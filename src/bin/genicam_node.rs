//! genicam_node - run the GenICam input node without a GUI.
//!
//! This runner:
//! 1. Loads the GenTL producers from GENICAM_GENTL64_PATH
//! 2. Builds the node into an in-memory editor
//! 3. Selects the requested camera and evaluates the node once per tick
//! 4. Logs acquisition latency and per-tick failures (a failed tick is skipped)
//! 5. On exit, closes the node and optionally writes its settings and last frame

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use genicam_input_node::{
    evaluate_contained, GenICamInputNode, GenTlPath, HeadlessEditor, ImageMap, Node, NodeEditor,
    ResultMap, SharedConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Acquire frames with the GenICam input node")]
struct Args {
    /// GenTL producer directories (or stub://N for synthetic cameras).
    #[arg(long, env = "GENICAM_GENTL64_PATH")]
    gentl_path: Option<String>,

    /// Device index to select; omit to leave the selector empty.
    #[arg(long)]
    device: Option<usize>,

    /// Number of ticks to run; 0 runs until Ctrl-C.
    #[arg(long, default_value_t = 0)]
    ticks: u64,

    /// Delay between ticks in milliseconds.
    #[arg(long, default_value_t = 100)]
    interval_ms: u64,

    /// Node id used for item tags.
    #[arg(long, default_value_t = 1)]
    node_id: u32,

    /// List discovered devices and exit.
    #[arg(long)]
    list: bool,

    /// Write the node settings (JSON) here on exit.
    #[arg(long)]
    settings_out: Option<PathBuf>,

    /// Write the last acquired frame (JPEG) here on exit.
    #[arg(long)]
    snapshot: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = SharedConfig::load()?;

    let path = match &args.gentl_path {
        Some(value) => GenTlPath::parse(value)?,
        None => GenTlPath::from_env()?,
    };
    let mut node = GenICamInputNode::with_gentl_path(&path)?;

    if args.list {
        let registry = node
            .registry()
            .ok_or_else(|| anyhow!("device registry unavailable"))?;
        for info in registry.devices() {
            println!(
                "{}\t{}\t{} {}\tserial={}\t{}",
                info.index, info.id, info.vendor, info.model, info.serial_number, info.source
            );
        }
        node.close(args.node_id)?;
        return Ok(());
    }

    let mut editor = HeadlessEditor::new();
    let node_tag = node.build(&mut editor, "headless", args.node_id, [0.0, 0.0], &config)?;
    if let Some(device) = args.device {
        let selector = format!("{node_tag}:Int:Input01Value");
        editor.set_value(&selector, &device.to_string())?;
    }

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))
            .context("install Ctrl-C handler")?;
    }

    log::info!(
        "genicam_node running: {} display {}x{}, timeout {}ms",
        node_tag,
        config.display_width,
        config.display_height,
        config.acquisition_timeout.as_millis()
    );

    let latency_tag = format!("{node_tag}:TimeMS:Output02Value");
    let mut images = ImageMap::new();
    let results = ResultMap::new();
    let mut tick = 0u64;
    let mut frames = 0u64;
    let mut last_health_log = Instant::now();

    while running.load(Ordering::SeqCst) && (args.ticks == 0 || tick < args.ticks) {
        tick += 1;
        let output = evaluate_contained(&mut node, &mut editor, args.node_id, &[], &images, &results);
        if let Some(image) = output.image {
            frames += 1;
            if config.use_pref_counter {
                if let Some(latency) = editor.value(&latency_tag) {
                    log::debug!("tick {}: {}x{} frame in {}", tick, image.width(), image.height(), latency);
                }
            }
            images.insert(node_tag.clone(), image);
        }

        if last_health_log.elapsed() >= Duration::from_secs(5) {
            log::info!("ticks={} frames={} camera={:?}", tick, frames, node.open_camera());
            last_health_log = Instant::now();
        }

        std::thread::sleep(Duration::from_millis(args.interval_ms));
    }

    log::info!("stopping after {} tick(s), {} frame(s)", tick, frames);

    if let Some(path) = &args.settings_out {
        let settings = node.settings(&editor, args.node_id)?;
        let json = serde_json::to_string_pretty(&settings)?;
        std::fs::write(path, json)
            .with_context(|| format!("write settings to {}", path.display()))?;
        log::info!("settings written to {}", path.display());
    }

    if let Some(path) = &args.snapshot {
        match images.get(&node_tag) {
            Some(image) => {
                image
                    .save(path)
                    .with_context(|| format!("write snapshot to {}", path.display()))?;
                log::info!("snapshot written to {}", path.display());
            }
            None => log::warn!("no frame acquired; snapshot skipped"),
        }
    }

    node.close(args.node_id)?;
    Ok(())
}
