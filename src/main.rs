mod console;

use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use chorus_backend::config::FleetConfig;
use chorus_backend::runtime::BackendRuntime;
use console::{format_event, Console, Flow};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,chorus=info")),
        )
        .init();

    let config = FleetConfig::load();
    tracing::info!(
        "Chorus console starting (homeserver {}, database {})",
        config.homeserver_url,
        config.database_path
    );

    let (event_tx, event_rx) = flume::unbounded();
    let runtime = BackendRuntime::bootstrap(config, event_tx)
        .context("failed to bootstrap fleet runtime")?;
    let (handle, fleet_thread) = runtime.spawn_fleet_thread()?;

    // Session events arrive asynchronously; print them as they come.
    std::thread::Builder::new()
        .name("chorus-events".to_string())
        .spawn(move || {
            while let Ok(event) = event_rx.recv() {
                println!("{}", format_event(&event));
            }
        })
        .context("failed to spawn event printer")?;

    let mut console = Console::new(handle);
    let mut print = |line: String| println!("{}", line);

    let mut flow = Flow::Continue;
    if let Some(script) = std::env::args().nth(1) {
        flow = console
            .run_script(&PathBuf::from(&script), &mut print)
            .with_context(|| format!("script {} failed", script))?;
    } else {
        println!("{}", console::HELP);
    }

    if flow == Flow::Continue {
        let stdin = std::io::stdin();
        let mut lines = stdin.lock().lines();
        loop {
            print!("chorus> ");
            let _ = std::io::stdout().flush();
            let Some(line) = lines.next() else { break };
            let line = line.context("failed to read stdin")?;
            if console.execute_line(&line, &mut print) == Flow::Quit {
                break;
            }
        }
    }

    // Dropping the last handle lets the fleet thread shut every session down.
    drop(console);
    if fleet_thread.join().is_err() {
        tracing::error!("Fleet thread panicked");
    }
    Ok(())
}
