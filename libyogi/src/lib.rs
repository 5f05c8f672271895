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

/*! The yogi messaging engine and hub daemon.

The engine builds a mesh of endpoints (leaves and nodes) whose
terminals exchange typed messages through bindings and subscriptions;
the hub exposes the engine to external clients over a binary frame
protocol. See the crate-level types for the engine API and [`run`] for
the daemon entry point.
*/

use std::{fs, io, sync::Mutex};

use anyhow::Context as _;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt::format::FmtSpan, layer::SubscriberExt as _, util::SubscriberInitExt as _};

mod binding;
mod config;
mod connection;
mod consts;
mod endpoint;
mod errors;
pub mod hub;
mod path;
mod process;
mod scheduler;
mod terminal;
mod wire;

pub use binding::Binding;
pub use config::Configuration;
pub use connection::{AutoConnectingTcpClient, LocalConnection, TcpClient, TcpConnection, TcpServer};
pub use endpoint::{Endpoint, Leaf, Node};
pub use errors::{Error, Result};
pub use path::Path;
pub use process::{Anomaly, OperationalCondition, ProcessInterface, ProcessLogLayer, Verbosity};
pub use scheduler::Scheduler;
pub use terminal::{ControlFlow, GatheredMessage, Message, Operation, ScatteredMessage, Terminal};
pub use yogi_protocol::{
    gather_flags, BindingState, ChangeType, EndpointKind, SessionRequest, SessionResponse,
    Signature, SubscriptionState, TerminalInfo, TerminalKind, MAX_MESSAGE_SIZE,
};

/// The command line arguments that the yogi hub expects.
/// These can be directly parsed with clap or manually constructed.
/// Command line arguments override corresponding settings in the
/// configuration files.
#[derive(Parser, Debug)]
#[clap(author, about)]
pub struct Args {
    #[clap(
        long,
        action,
        long_help = "The file to write logs to

By default logs go to stderr."
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
        short = 'c',
        long = "connection_target",
        help = "YOGI server to connect to (e.g. 'hostname:12000')"
    )]
    pub connection_target: Option<String>,

    #[clap(
        short = 't',
        long = "connection_timeout",
        allow_hyphen_values = true,
        help = "Connection timeout in seconds (-1 for infinity)"
    )]
    pub connection_timeout: Option<f64>,

    #[clap(short = 'i', long, help = "Identification for YOGI connections")]
    pub connection_identification: Option<String>,

    #[clap(
        short = 'l',
        long,
        help = "Location of the terminals for this process in the YOGI terminal tree"
    )]
    pub location: Option<String>,

    #[clap(
        short = 'j',
        long = "json",
        help = "Configuration overrides (in JSON format, e.g. '{ \"my-age\": 42 }')"
    )]
    pub json_overrides: Vec<String>,

    #[clap(help = "Configuration files (JSON format), merged in order")]
    pub config_files: Vec<String>,
}

/// Run the hub with the given arguments. Returns only on a fatal
/// startup error; a clean shutdown goes through the signal handler.
pub fn run(args: Args) -> anyhow::Result<()> {
    let trace_level = if args.verbose == 0 {
        tracing_subscriber::filter::LevelFilter::INFO
    } else if args.verbose == 1 {
        tracing_subscriber::filter::LevelFilter::DEBUG
    } else {
        tracing_subscriber::filter::LevelFilter::TRACE
    };

    let (filter, log_level_handle) = tracing_subscriber::reload::Layer::new(trace_level);
    let log_layer = ProcessLogLayer::detached();

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_thread_ids(true)
        .with_target(false)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE);
    let registry = tracing_subscriber::registry().with(filter);
    if let Some(log_file) = args.log_file.clone() {
        let file = fs::File::create(log_file).context("creating log file")?;
        registry.with(fmt_layer.with_writer(Mutex::new(file))).with(log_layer.clone()).init();
    } else {
        registry.with(fmt_layer.with_writer(io::stderr)).with(log_layer.clone()).init();
    }

    info!("\n\n======================== STARTING HUB ============================\n\n");

    let configuration =
        Configuration::from_command_line(&args).context("loading configuration")?;

    let pi = ProcessInterface::with_log_handle(&configuration, Some(log_level_handle))
        .context("creating process interface")?;
    pi.attach_log_layer(&log_layer);

    // SIGINT/SIGTERM request a clean exit with code 0
    let mut signals =
        signal_hook::iterator::Signals::new([signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM])
            .context("installing signal handler")?;
    std::thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            info!("received signal {}, shutting down", signal);
            std::process::exit(0);
        }
    });

    let res = hub::run(&pi, &configuration);
    if let Err(err) = &res {
        error!("{:?}", err);
    }
    res
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::{thread, time};

    /// Poll until the predicate holds; panics after five seconds.
    pub fn wait_until<P>(mut pred: P)
    where
        P: FnMut() -> bool,
    {
        let deadline = time::Instant::now() + time::Duration::from_secs(5);
        while !pred() {
            if time::Instant::now() > deadline {
                panic!("condition never became true");
            }
            thread::sleep(time::Duration::from_millis(2));
        }
    }
}
