mod config;
mod event;
mod instance;
mod logger;
mod paths;
mod power;
mod react;
mod session;

use tokio::sync::mpsc;

use crate::config::ParsedArgs;
use crate::event::AgentEvent;
use crate::instance::{ControlSignal, InstanceRole};
use crate::logger::Logger;
use crate::react::Effect;

#[tokio::main]
async fn main() {
    // ── Command line ──────────────────────────────────────────────────────────
    let config = match config::parse_args(std::env::args().skip(1)) {
        Ok(ParsedArgs::Run(config)) => config,
        Ok(ParsedArgs::Help) => {
            println!("{}", config::USAGE);
            return;
        }
        Err(e) => {
            eprintln!("Error: {e}\n\n{}", config::USAGE);
            std::process::exit(2);
        }
    };

    // ── Logging ───────────────────────────────────────────────────────────────
    let logger = match &config.log_file {
        Some(path) => match Logger::to_file(path) {
            Ok(logger) => logger,
            Err(e) => {
                eprintln!("Failed to open log file {}: {e}", path.display());
                std::process::exit(1);
            }
        },
        None => Logger::disabled(),
    };

    // ── Instance role ─────────────────────────────────────────────────────────
    // Resolved exactly once; a Secondary delivers one signal and exits.
    let _guard = match instance::acquire_role() {
        Ok(InstanceRole::Primary(guard)) => guard,
        Ok(InstanceRole::Secondary) => {
            let signal = if config.kill_requested {
                ControlSignal::Terminate
            } else {
                ControlSignal::Probe
            };
            match instance::notify_primary(signal).await {
                Ok(()) => {
                    println!("Running instance signaled: {}", signal.to_wire());
                    return;
                }
                Err(e) => {
                    eprintln!("Failed to signal running instance: {e:#}");
                    std::process::exit(1);
                }
            }
        }
        Err(e) => {
            eprintln!("Failed to resolve instance role: {e:#}");
            std::process::exit(1);
        }
    };

    // -kill with nothing to kill: the claim succeeded, so no instance was
    // running. Report failure; the lock is released again on exit.
    if config.kill_requested {
        eprintln!("No running instance to terminate");
        std::process::exit(1);
    }

    logger.line("lidlock initializing");

    // ── Control endpoint ──────────────────────────────────────────────────────
    // Bound only after the lock claim above; instance.rs documents the
    // resulting race window for Secondaries arriving in between.
    let endpoint = match instance::bind_endpoint() {
        Ok(endpoint) => endpoint,
        Err(e) => {
            eprintln!("Failed to register control endpoint: {e:#}");
            std::process::exit(1);
        }
    };

    let (event_tx, mut event_rx) = mpsc::channel::<AgentEvent>(32);

    tokio::spawn(instance::serve(endpoint, event_tx.clone()));
    let watcher = power::start(event_tx.clone());

    // Graceful shutdown on Ctrl+C.
    {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(AgentEvent::Shutdown).await;
            }
        });
    }

    println!("lidlock-daemon v{} started", env!("CARGO_PKG_VERSION"));

    // ── Dispatch loop ─────────────────────────────────────────────────────────
    // Single-threaded dispatch: the recv below is the sole suspension point,
    // and no two events are ever handled concurrently.
    let mut exit_code = 0;
    while let Some(evt) = event_rx.recv().await {
        match evt {
            AgentEvent::Power(raw) => {
                let event = power::classify(raw, power::is_remote_session());
                logger.line(event.describe());

                let mut lock_failed = false;
                for effect in react::react(event, &config) {
                    match effect {
                        Effect::RunScript(path) => session::launch_script(&path, &logger),
                        Effect::LockSession => {
                            logger.line("locking session");
                            if let Err(e) = session::lock_session() {
                                eprintln!("[session] {e:#}");
                                logger.line(&format!("session lock failed: {e:#}"));
                                lock_failed = true;
                            }
                        }
                    }
                }
                if lock_failed {
                    // No recovery path for an OS that refuses to lock.
                    exit_code = 1;
                    break;
                }
            }

            AgentEvent::Control(signal) => {
                logger.line(&format!("control signal received: {}", signal.to_wire()));
                if signal.is_terminate() {
                    break;
                }
                // Probe (or anything unrecognized): observed, nothing more.
            }

            AgentEvent::Shutdown => {
                println!("Shutting down");
                break;
            }
        }
    }

    watcher.stop();
    logger.line("lidlock terminating");
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}
