use std::env;
use std::error::Error;
use std::process;
use std::sync::{Arc, Weak};
use std::thread;

use clap::Parser;
use log::{error, info};
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;

use chatroom_shmem::{AttachError, ChatSession, SessionConfig};

#[derive(clap::Parser)]
#[clap(about = "Chat with other processes on this host through shared memory")]
struct Opts {
    /// Room to join. Defaults to the account name.
    room: Option<String>,
    /// Display name. Defaults to $USER.
    #[clap(short = 'u', long = "user")]
    user: Option<String>,
    #[clap(short = 'c', long = "config")]
    config: Option<String>,
}

fn account_name() -> String {
    env::var("USER")
        .or_else(|_| env::var("LOGNAME"))
        .unwrap_or_else(|_| "anonymous".to_string())
}

fn report(err: &AttachError) {
    match err.os_error() {
        Some(os) => eprintln!("chat: {}: {}", err.step(), os),
        None => eprintln!("chat: {}", err),
    }
}

// Exiting from a signal skips destructors, so the owner's name is removed
// here or it would outlive the room.
fn watch_signals(session: Weak<ChatSession>) -> Result<(), Box<dyn Error>> {
    let mut signals = Signals::new(&[SIGHUP, SIGINT, SIGQUIT, SIGTERM])?;
    thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            info!("received signal {}, leaving the room", signal);
            if let Some(session) = session.upgrade() {
                if let Err(e) = session.request_stop() {
                    error!("failed to stop receiver: {}", e);
                }
                session.release_room();
            }
            process::exit(128 + signal);
        }
    });
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let opts: Opts = Opts::parse();
    let cfg: SessionConfig = match &opts.config {
        Some(path) => confy::load_path(path)?,
        None => SessionConfig::default(),
    };
    let room = opts.room.unwrap_or_else(account_name);
    let user = opts.user.unwrap_or_else(account_name);

    let session = Arc::new(ChatSession::new(cfg));
    if let Err(e) = session.attach(&room, &user) {
        report(&e);
        process::exit(1);
    }
    info!(
        "joined room {:?} as {:?}; type {:?} to leave",
        room,
        user,
        session.config().quit_command
    );

    watch_signals(Arc::downgrade(&session))?;
    session.run()?;
    Ok(())
}
