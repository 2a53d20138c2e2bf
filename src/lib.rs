// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{env, fs, io, path::PathBuf, sync::Arc, sync::Mutex};

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
pub use hooks::{Hooks, KvRequest, KvResult, NoopHooks};
use tracing::error;
use tracing_subscriber::fmt::format::FmtSpan;

mod config;
mod consts;
mod daemon;
mod hooks;
pub mod protocol;

/// The command line arguments that codewire expects. These can be
/// directly parsed with clap or manually constructed in order to
/// present some other user interface.
///
/// NOTE: You must check `version()` and handle it yourself
/// if it is set. Clap won't do a good job with its
/// automatic version support for a library.
#[derive(Parser, Debug)]
#[clap(author, about)]
pub struct Args {
    #[clap(
        short,
        long,
        action,
        long_help = "The file to write logs to

By default logs go to stderr when running in daemon mode."
    )]
    pub log_file: Option<String>,

    #[clap(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Show more in logs, may be provided multiple times",
    )]
    pub verbose: u8,

    #[clap(
        short,
        long,
        action,
        long_help = "The path for the unix socket to listen on

This defaults to <data_dir>/codewire.sock."
    )]
    pub socket: Option<String>,

    #[clap(
        short,
        long,
        action,
        long_help = "The directory holding the node's socket and session catalogue

This defaults to $XDG_RUNTIME_DIR/codewire or ~/.codewire
if XDG_RUNTIME_DIR is unset."
    )]
    pub data_dir: Option<String>,

    #[clap(short, long, action, help = "a toml file containing configuration")]
    pub config_file: Option<String>,

    #[clap(subcommand)]
    pub command: Commands,
}

/// The subcommands that codewire supports.
#[derive(Subcommand, Debug)]
pub enum Commands {
    #[clap(about = "Print version")]
    Version,

    #[clap(about = "Starts the session multiplexer node")]
    Daemon,
}

impl Args {
    /// Version indicates if the wrapping binary must display the
    /// version then exit.
    pub fn version(&self) -> bool {
        matches!(self.command, Commands::Version)
    }
}

/// Run the codewire node with the given arguments. If hooks are
/// provided, they are spliced into the daemon (KV relay forwarding
/// and session lifecycle callbacks).
pub fn run(args: Args, hooks: Option<Box<dyn Hooks + Send + Sync>>) -> anyhow::Result<()> {
    let trace_level = if args.verbose == 0 {
        tracing::Level::INFO
    } else if args.verbose == 1 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::TRACE
    };
    if let Some(log_file) = args.log_file.clone() {
        let file = fs::File::create(log_file)?;
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(Mutex::new(file))
            .init();
    } else if let Commands::Daemon = args.command {
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(io::stderr)
            .init();
    }

    let config = config::read_config(&args.config_file)?;

    let data_dir = match &args.data_dir {
        Some(dir) => PathBuf::from(dir),
        None => match env::var("XDG_RUNTIME_DIR") {
            Ok(runtime_dir) => PathBuf::from(runtime_dir).join("codewire"),
            Err(_) => PathBuf::from(env::var("HOME").context("no XDG_RUNTIME_DIR or HOME")?)
                .join(".codewire"),
        },
    };

    let socket = match &args.socket {
        Some(s) => PathBuf::from(s),
        None => data_dir.join(consts::SOCKET_FILE),
    };

    let hooks: Arc<dyn Hooks + Send + Sync> = match hooks {
        Some(hooks) => Arc::from(hooks),
        None => Arc::new(NoopHooks),
    };

    let res: anyhow::Result<()> = match args.command {
        Commands::Version => return Err(anyhow!("wrapper binary must handle version")),
        Commands::Daemon => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("building async runtime")?;
            runtime.block_on(daemon::run(config, data_dir, hooks, socket))
        }
    };

    if let Err(err) = res {
        error!("{:?}", err);
        std::process::exit(1);
    }

    Ok(())
}
