//! `replog` binary: run a master or a secondary over HTTP.
//!
//! ```bash
//! SECONDARIES=http://s1:8001,http://s2:8002 replog master --port 8000
//! REPLICA_ID=s1 MASTER_URL=http://master:8000 replog secondary --port 8001
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use replog::http::{
    HttpClient, HttpMasterSource, HttpReplicaTransport, serve_master, serve_secondary,
};
use replog::{
    BackoffConfig, Master, MasterConfig, ReplicaEndpoint, Secondary, SecondaryConfig,
    TokioTimeProvider, WriteConcernDefault,
};

#[derive(Parser, Debug)]
#[command(name = "replog")]
#[command(about = "Primary-backup replicated append-only log", long_about = None)]
struct Args {
    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Accept writes and replicate them to the secondaries.
    Master {
        /// Port to listen on.
        #[arg(long, env = "PORT", default_value = "8000")]
        port: u16,

        /// Comma-separated secondary URLs, optionally `id=url`.
        #[arg(long, env = "SECONDARIES", default_value = "")]
        secondaries: String,

        /// First retry delay in milliseconds.
        #[arg(long, env = "BACKOFF_BASE_MS", default_value = "50")]
        backoff_base_ms: u64,

        /// Retry delay ceiling in milliseconds.
        #[arg(long, env = "BACKOFF_MAX_MS", default_value = "5000")]
        backoff_max_ms: u64,

        /// Deadline for one replicate call in milliseconds.
        #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value = "5000")]
        request_timeout_ms: u64,

        /// How long a client waits for its write concern, in milliseconds.
        #[arg(long, env = "QUORUM_TIMEOUT_MS", default_value = "30000")]
        quorum_timeout_ms: u64,

        /// Write concern when a request carries no `w`: `1` or `all`.
        #[arg(long, env = "DEFAULT_W", default_value = "1")]
        default_w: WriteConcernDefault,
    },

    /// Persist replicated entries and serve them.
    Secondary {
        /// Port to listen on.
        #[arg(long, env = "PORT", default_value = "8001")]
        port: u16,

        /// This replica's id.
        #[arg(long, env = "REPLICA_ID", default_value = "s1")]
        replica_id: String,

        /// Base URL of the master, for catch-up.
        #[arg(long, env = "MASTER_URL", default_value = "http://master:8000")]
        master_url: String,

        /// Directory for the durable log.
        #[arg(long, env = "DATA_DIR", default_value = "/data")]
        data_dir: PathBuf,

        /// Artificial delay before handling each replicate call.
        #[arg(long, env = "PROCESS_DELAY_MS", default_value = "0")]
        process_delay_ms: u64,

        /// Delay before loading state, in seconds.
        #[arg(long, env = "START_DELAY_SEC", default_value = "0")]
        start_delay_sec: u64,

        /// Probability of failing a replicate call after persisting.
        #[arg(long, env = "FAIL_AFTER_PERSIST_RATE", default_value = "0.0")]
        fail_after_persist_rate: f64,

        /// Entries requested per catch-up page.
        #[arg(long, env = "CATCH_UP_PAGE_SIZE", default_value = "1000")]
        catch_up_page_size: usize,

        /// Deadline for one catch-up request in milliseconds.
        #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value = "5000")]
        request_timeout_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,replog=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let args = Args::parse();
    match args.role {
        Role::Master {
            port,
            secondaries,
            backoff_base_ms,
            backoff_max_ms,
            request_timeout_ms,
            quorum_timeout_ms,
            default_w,
        } => {
            let request_timeout = Duration::from_millis(request_timeout_ms);
            let config = MasterConfig::new(ReplicaEndpoint::parse_list(&secondaries)?)
                .with_backoff(BackoffConfig::new(
                    Duration::from_millis(backoff_base_ms),
                    Duration::from_millis(backoff_max_ms),
                ))
                .with_request_timeout(request_timeout)
                .with_quorum_timeout(Duration::from_millis(quorum_timeout_ms))
                .with_default_write_concern(default_w);

            let transport = HttpReplicaTransport::new(HttpClient::new(request_timeout));
            let master = Arc::new(Master::start(config, transport, TokioTimeProvider::new())?);
            let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
            serve_master(listener, master).await?;
        }
        Role::Secondary {
            port,
            replica_id,
            master_url,
            data_dir,
            process_delay_ms,
            start_delay_sec,
            fail_after_persist_rate,
            catch_up_page_size,
            request_timeout_ms,
        } => {
            let mut config = SecondaryConfig::new(replica_id)
                .with_master_url(master_url)
                .with_data_dir(data_dir)
                .with_process_delay(Duration::from_millis(process_delay_ms))
                .with_fail_after_persist_rate(fail_after_persist_rate)
                .with_catch_up_page_size(catch_up_page_size)
                .with_request_timeout(Duration::from_millis(request_timeout_ms));
            config.start_delay = Duration::from_secs(start_delay_sec);

            if !config.start_delay.is_zero() {
                info!(delay_s = start_delay_sec, "delaying startup");
                tokio::time::sleep(config.start_delay).await;
            }

            let time = TokioTimeProvider::new();
            let source = HttpMasterSource::for_secondary(&config, time.clone());
            let secondary = Arc::new(Secondary::open_in_data_dir(config, time)?);
            let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;

            let catching_up = Arc::clone(&secondary);
            tokio::spawn(async move {
                if let Err(e) = catching_up.catch_up(&source).await {
                    warn!(error = %e, "catch-up did not complete, relying on live replication");
                }
            });
            serve_secondary(listener, secondary).await?;
        }
    }
    Ok(())
}
