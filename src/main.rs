use anyhow::{Context, Result, bail};
use clap::{Arg, Command};
use log::{info, warn};
use mediahub::capture::{CaptureCenter, CaptureKind};
use mediahub::config::{self, Config, app_name, app_version};
use mediahub::graph::{MediaGraph, MemoryGraph, MessageKind};
use mediahub::hub::SharedPipeline;
use mediahub::player::{BackendKind, MediaResource, PlaybackBackend, RecordingClient};
use std::sync::Arc;
use std::time::Duration;
use std::{panic, process};

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let matches = Command::new(app_name())
        .version(app_version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file.")
                .required(false),
        )
        .arg(
            Arg::new("scenario")
                .short('s')
                .long("scenario")
                .value_name("SCENARIO")
                .help("Demo to run (attach/buffering).")
                .value_parser(["attach", "buffering"])
                .ignore_case(true)
                .default_value("attach"),
        )
        .get_matches();

    let config = match matches.get_one::<String>("config") {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read config file {}", path))?;
            config::load_from_str(&json).with_context(|| format!("invalid config file {}", path))?
        }
        None => Config::default(),
    };

    // kill the main thread as soon as a secondary thread panics
    let orig_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        orig_hook(panic_info);
        process::exit(105);
    }));

    ctrlc::set_handler(move || {
        process::exit(130);
    })
    .context("Error setting Ctrl-C handler")?;

    let scenario = matches
        .get_one::<String>("scenario")
        .map(|s| s.to_lowercase())
        .unwrap_or_default();
    match scenario.as_str() {
        "buffering" => buffering_scenario(&config),
        _ => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(attach_scenario(config))
        }
    }
}

/// Two players share one capture source; the source goes away with the last.
async fn attach_scenario(config: Config) -> Result<()> {
    let graph = Arc::new(MemoryGraph::new());
    let dyn_graph: Arc<dyn MediaGraph> = graph.clone();
    let hub = SharedPipeline::new(dyn_graph, config.hub.clone())?;
    let control = tokio::spawn(Arc::clone(&hub).run());

    let center = Arc::new(CaptureCenter::discover(graph.as_ref()));
    center.register_all(&hub);
    let Some(source) = center.first_source(CaptureKind::Audio) else {
        bail!("no audio capture source found");
    };
    info!("using capture source '{}' ({})", source.name, source.id);

    let mut first = PlaybackBackend::for_stream(
        Arc::clone(&hub),
        config.player.clone(),
        Arc::new(RecordingClient::new()),
    );
    let mut second = PlaybackBackend::for_stream(
        Arc::clone(&hub),
        config.player.clone(),
        Arc::new(RecordingClient::new()),
    );
    first.load(MediaResource::Stream(center.create_media_stream(true, false)))?;
    second.load(MediaResource::Stream(center.create_media_stream(true, false)))?;
    info!(
        "'{}' has {} attachment(s)",
        source.id,
        hub.attachment_count(&source.id)
    );

    first.pause()?;
    wait_for_teardowns(&hub).await;
    info!(
        "after first detach: source present = {}",
        hub.has_source(&source.id)
    );

    second.pause()?;
    wait_for_teardowns(&hub).await;
    info!(
        "after second detach: source present = {}",
        hub.has_source(&source.id)
    );

    drop(first);
    drop(second);
    info!("{}", hub.health().summary());
    hub.shutdown();
    control.await?;
    Ok(())
}

async fn wait_for_teardowns(hub: &SharedPipeline) {
    for _ in 0..100 {
        if hub.pending_teardowns() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    warn!("{} teardown(s) still pending", hub.pending_teardowns());
}

/// URI playback fed with buffering progress 10%, 55%, 100%.
fn buffering_scenario(config: &Config) -> Result<()> {
    let graph = Arc::new(MemoryGraph::new());
    let client = Arc::new(RecordingClient::new());
    let mut backend = PlaybackBackend::new(
        graph.clone(),
        BackendKind::Uri,
        config.player.clone(),
        client.clone(),
    );

    backend.load(MediaResource::Uri("file:///demo/track.ogg".to_string()))?;
    pump(&graph, &mut backend);
    backend.play()?;
    pump(&graph, &mut backend);

    let Some(node) = backend.node() else {
        bail!("player has no sink");
    };
    graph.set_duration(node, Duration::from_secs(180));
    for percent in [10, 55, 100] {
        graph.post_message(node, MessageKind::Buffering(percent));
        pump(&graph, &mut backend);
        info!(
            "buffering {}%: graph {:?}, ready {}, network {}",
            percent,
            graph.current_state(node),
            backend.ready_state(),
            backend.network_state()
        );
    }

    for event in client.events() {
        info!("client: {}", event);
    }
    Ok(())
}

fn pump(graph: &MemoryGraph, backend: &mut PlaybackBackend) {
    for _ in 0..3 {
        graph.wait_idle();
        backend.dispatch_bus_messages();
    }
}
