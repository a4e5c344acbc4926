// Spiderpool coordinator: a chained CNI plugin that tunes pod routing,
// neighbour tables and hardware addresses after the main plugin ran.

mod agent;
mod cni;
mod config;
mod coordinator;
mod ipchecking;
mod networking;
mod utils;

use clap::Parser;
use cni::types::{CniError, K8sArgs, ERR_INVALID_ENV, ERR_IO};
use cni::{CmdArgs, CniCommand};
use config::{LogOptions, NetConf};
use std::io::{Read, Write};
use tracing::Instrument;

/// Runtime contract: everything arrives via CNI_* variables and stdin.
#[derive(Parser, Debug)]
#[clap(author, version, about = "Chained CNI plugin coordinating multi-NIC pod routing")]
struct CniEnv {
    #[clap(long, env = "CNI_COMMAND")]
    command: Option<String>,

    #[clap(long, env = "CNI_CONTAINERID", default_value = "")]
    container_id: String,

    #[clap(long, env = "CNI_NETNS", default_value = "")]
    netns: String,

    #[clap(long, env = "CNI_IFNAME", default_value = "")]
    if_name: String,

    #[clap(long, env = "CNI_ARGS", default_value = "")]
    args: String,

    #[clap(long, env = "CNI_PATH", default_value = "")]
    path: String,
}

impl CniEnv {
    fn into_cmd_args(self) -> Result<CmdArgs, CniError> {
        let command = self
            .command
            .as_deref()
            .ok_or_else(|| CniError::new(ERR_INVALID_ENV, "required env variable CNI_COMMAND is missing"))?
            .parse::<CniCommand>()?;
        Ok(CmdArgs {
            command,
            container_id: self.container_id,
            netns: self.netns,
            if_name: self.if_name,
            args: K8sArgs::parse(&self.args)?,
            path: self.path,
        })
    }
}

fn read_stdin(command: CniCommand) -> Result<Vec<u8>, CniError> {
    let mut buf = Vec::new();
    if command != CniCommand::Version {
        std::io::stdin()
            .read_to_end(&mut buf)
            .map_err(|e| CniError::new(ERR_IO, "failed to read network configuration").with_details(e.to_string()))?;
    }
    Ok(buf)
}

async fn run(env: CniEnv) -> Result<String, CniError> {
    let args = env.into_cmd_args()?;
    let stdin = read_stdin(args.command)?;

    // Logging must not depend on a valid config: a broken one still gets logged.
    let log_options = NetConf::parse(&stdin)
        .map(|c| c.log_options)
        .unwrap_or_else(|_| LogOptions::default());
    utils::logger::init(&log_options);

    let span = tracing::info_span!(
        "cni",
        command = ?args.command,
        container_id = %args.container_id,
        netns = %args.netns,
        if_name = %args.if_name,
        pod = %args.args.pod(),
        cni_path = %args.path,
    );
    async {
        tracing::info!("invoked");
        let result = cni::dispatch(&args, &stdin).await;
        match &result {
            Ok(_) => tracing::info!("succeeded"),
            Err(e) => tracing::error!(code = e.code, error = %e, "failed"),
        }
        result
    }
    .instrument(span)
    .await
}

#[tokio::main]
async fn main() {
    let env = CniEnv::parse();
    let mut stdout = std::io::stdout();

    match run(env).await {
        Ok(out) => {
            if !out.is_empty() {
                let _ = writeln!(stdout, "{}", out);
            }
        }
        Err(e) => {
            let _ = writeln!(stdout, "{}", e.to_json());
            let _ = stdout.flush();
            std::process::exit(1);
        }
    }
}
