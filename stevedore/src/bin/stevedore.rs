use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use stevedore::config::Config;
use stevedore::receiver::{self, ServeOutcome, Server};
use stevedore::sender::{self, Sender};
use stevedore::signals::Event;
use tracing::{error, info};
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path to a stevedore config file
    config_path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error(transparent)]
    Config(#[from] stevedore::config::Error),
    #[error(transparent)]
    Receiver(#[from] receiver::Error),
    #[error(transparent)]
    Sender(#[from] sender::Error),
}

/// Events are one-shot, but a process may be restarted many times; the
/// restart slot holds the event for the current serve round so SIGUSR1
/// always hits the live one.
struct SignalHub {
    stop: Event,
    restart_slot: Arc<std::sync::Mutex<Event>>,
    interrupted: Arc<AtomicBool>,
}

impl SignalHub {
    /// Install a fresh restart event for the next serve round.
    fn arm_restart(&self) -> Event {
        let restart = Event::new();
        *self.restart_slot.lock().expect("restart slot poisoned") = restart.clone();
        restart
    }
}

/// Wire SIGTERM/SIGINT to the stop event and SIGUSR1 to the current
/// restart event.
fn install_signal_handlers() -> SignalHub {
    let hub = SignalHub {
        stop: Event::new(),
        restart_slot: Arc::new(std::sync::Mutex::new(Event::new())),
        interrupted: Arc::new(AtomicBool::new(false)),
    };
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let stop_on_term = hub.stop.clone();
        tokio::spawn(async move {
            let mut term =
                signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
            term.recv().await;
            stop_on_term.set();
        });
        let stop_on_int = hub.stop.clone();
        let was_interrupted = Arc::clone(&hub.interrupted);
        tokio::spawn(async move {
            let mut int =
                signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
            int.recv().await;
            was_interrupted.store(true, Ordering::SeqCst);
            stop_on_int.set();
        });
        let restart_slot = Arc::clone(&hub.restart_slot);
        tokio::spawn(async move {
            let mut usr1 = signal(SignalKind::user_defined1())
                .expect("failed to install SIGUSR1 handler");
            loop {
                usr1.recv().await;
                restart_slot
                    .lock()
                    .expect("restart slot poisoned")
                    .set();
            }
        });
    }
    #[cfg(not(unix))]
    {
        let stop = hub.stop.clone();
        let was_interrupted = Arc::clone(&hub.interrupted);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                was_interrupted.store(true, Ordering::SeqCst);
                stop.set();
            }
        });
    }
    hub
}

async fn serve(config: Config, stop: &Event, restart: &Event) -> Result<ServeOutcome, Error> {
    let servers: Vec<Server> = config.receiver.into_iter().map(Server::new).collect();
    let senders: Vec<Sender> = config.sender.into_iter().map(Sender::new).collect();
    info!(
        "hosting {} receiver(s), opening {} sender(s)",
        servers.len(),
        senders.len()
    );

    let receivers = async {
        let runs = servers.iter().map(|server| async move {
            let result = server
                .serve_until_signal(stop, restart, config.notify_pid)
                .await;
            if result.is_err() {
                // One endpoint failing takes the whole process down.
                stop.set();
            }
            result
        });
        let mut outcome = ServeOutcome::Stopped;
        for result in futures::future::join_all(runs).await {
            outcome = result?;
        }
        Ok::<_, Error>(outcome)
    };
    // Clients connect once the servers are up, so a config can point a
    // sender at its own receiver, and stay open until a signal.
    let clients = async {
        if senders.is_empty() {
            return Ok(None);
        }
        for server in &servers {
            tokio::select! {
                () = server.wait_started() => {}
                () = stop.wait() => return Ok(None),
                () = restart.wait() => return Ok(Some(ServeOutcome::Restart)),
            }
        }
        let mut open = Vec::with_capacity(senders.len());
        for sender in &senders {
            match sender.connect().await {
                Ok(client) => open.push(client),
                Err(connect_error) => {
                    stop.set();
                    return Err(Error::Sender(connect_error));
                }
            }
        }
        let outcome = tokio::select! {
            () = stop.wait() => ServeOutcome::Stopped,
            () = restart.wait() => ServeOutcome::Restart,
        };
        for client in open {
            client.close().await;
        }
        Ok(Some(outcome))
    };

    let (receivers_outcome, clients_outcome) = tokio::join!(receivers, clients);
    let outcome = receivers_outcome?;
    match clients_outcome? {
        Some(ServeOutcome::Restart) => Ok(ServeOutcome::Restart),
        _ => Ok(outcome),
    }
}

async fn run(args: Args) -> Result<i32, Error> {
    let hub = install_signal_handlers();

    let mut config = Config::from_path(&args.config_path)?;
    loop {
        let restart = hub.arm_restart();
        match serve(config, &hub.stop, &restart).await? {
            ServeOutcome::Stopped => break,
            ServeOutcome::Restart => {
                info!("restart requested, reloading configuration");
                match Config::from_path(&args.config_path) {
                    Ok(reloaded) => config = reloaded,
                    Err(reload_error) => {
                        // Reload with the file gone means stop.
                        error!(%reload_error, "could not reload configuration, stopping");
                        break;
                    }
                }
            }
        }
    }
    if hub.interrupted.load(Ordering::SeqCst) {
        return Ok(130);
    }
    Ok(0)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .finish()
        .init();

    let args = Args::parse();
    let code = match run(args).await {
        Ok(code) => code,
        Err(Error::Config(config_error)) => {
            error!("configuration error: {config_error}");
            2
        }
        Err(run_error) => {
            error!("startup error: {run_error}");
            3
        }
    };
    std::process::exit(code);
}
