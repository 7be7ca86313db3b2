// Copyright 2024 Google LLC
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

use std::{
    fs::File,
    io::BufWriter,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use repack_api::{ChannelId, ObjectRef, RepackOrchestrator};
use repack_server::AppState;
use repack_sign::{crypto_keys::Keys, OpensslSigner, Pkcs7Signer, Signer};
use repack_store::{MultipartConfig, ObjectStore, RetryingStore, S3Config, S3Store};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Writes a channel id into packages stored in a bucket and re-signs them,
/// without downloading or re-uploading the untouched bytes.
///
/// ```
/// $ repack --cert cert.pem --key key.pem serve --listen 0.0.0.0:8080
/// $ curl -H 'Range: bytes=0-1023' 'localhost:8080/?src=apps/game.apk&cid=huawei'
/// $ repack local --src apps/game.apk --cid huawei --out game_huawei.apk
/// $ repack materialize --src apps/game.apk --cid huawei --dest apps/channels/game_huawei.apk
/// ```
///
/// Without `--cert` and `--key` a random self-signed testing key is used.
#[derive(Parser, Debug)]
#[command(name = "repack", version, about, long_about = None)]
struct Args {
    /// Scratch directory holding computed footers
    #[arg(long, env = "REPACK_WORK_DIR", default_value = "/mnt/auto", global = true)]
    work_dir: PathBuf,
    #[arg(long, env = "REPACK_REGION", global = true)]
    region: Option<String>,
    /// S3-compatible endpoint URL
    #[arg(long, env = "REPACK_ENDPOINT", global = true)]
    endpoint: Option<String>,
    #[arg(long, env = "REPACK_PATH_STYLE", global = true)]
    path_style: bool,
    /// PEM signing certificate
    #[arg(long, env = "REPACK_CERT", global = true)]
    cert: Option<PathBuf>,
    /// PEM private key, PKCS#8 or PKCS#1
    #[arg(long, env = "REPACK_KEY", global = true)]
    key: Option<PathBuf>,
    #[arg(long, value_enum, env = "REPACK_SIGNER", default_value_t = SignerKind::Native, global = true)]
    signer: SignerKind,
    #[arg(long, env = "REPACK_OPENSSL_BIN", default_value = "openssl", global = true)]
    openssl_bin: PathBuf,
    #[command(subcommand)]
    command: Command
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum SignerKind {
    /// Sign in-process
    Native,
    /// Shell out to `openssl smime`
    Openssl
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve repacked packages over HTTP range requests
    Serve {
        #[arg(long, env = "REPACK_LISTEN", default_value = "0.0.0.0:80")]
        listen: SocketAddr
    },
    /// Write a repacked package to a local file
    Local {
        #[arg(long)]
        src: String,
        #[arg(long)]
        cid: String,
        #[arg(long)]
        out: PathBuf
    },
    /// Store a repacked package as a new object
    Materialize {
        #[arg(long)]
        src: String,
        #[arg(long)]
        cid: String,
        #[arg(long)]
        dest: String,
        #[arg(long, default_value_t = MultipartConfig::default().workers)]
        workers: usize,
        #[arg(long, default_value_t = MultipartConfig::default().part_size)]
        part_size: u64,
        #[arg(long, default_value_t = MultipartConfig::default().min_part_size)]
        min_part_size: u64
    }
}

fn build_signer(args: &Args) -> Result<Arc<dyn Signer>> {
    match (args.signer, &args.cert, &args.key) {
        (SignerKind::Openssl, Some(cert), Some(key)) => Ok(Arc::new(OpensslSigner {
            program: args.openssl_bin.clone(),
            certificate: cert.clone(),
            private_key: key.clone()
        })),
        (SignerKind::Openssl, _, _) => bail!("the openssl signer needs --cert and --key"),
        (SignerKind::Native, Some(cert), Some(key)) => {
            let keys = Keys::from_pem_files(cert, key)
                .with_context(|| format!("loading {} and {}", cert.display(), key.display()))?;
            Ok(Arc::new(Pkcs7Signer::new(keys)?))
        }
        (SignerKind::Native, None, None) => {
            let keys = Keys::generate_random_testing_keys()?;
            Ok(Arc::new(Pkcs7Signer::new(keys)?))
        }
        (SignerKind::Native, _, _) => bail!("--cert and --key must be given together")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let signer = build_signer(&args)?;
    let s3 = S3Store::connect(&S3Config {
        region: args.region.clone(),
        endpoint: args.endpoint.clone(),
        force_path_style: args.path_style
    })
    .await;
    let store: Arc<dyn ObjectStore> = Arc::new(RetryingStore::new(s3));
    let orchestrator = RepackOrchestrator::new(store, signer, &args.work_dir);

    match args.command {
        Command::Serve { listen } => {
            let listener = tokio::net::TcpListener::bind(listen)
                .await
                .with_context(|| format!("binding {listen}"))?;
            info!(%listen, work_dir = %args.work_dir.display(), "repack server listening");
            repack_server::serve(listener, AppState::new(orchestrator)).await?;
        }
        Command::Local { src, cid, out } => {
            let source = ObjectRef::parse(&src)?;
            let channel = ChannelId::parse(&cid)?;
            let size = tokio::task::spawn_blocking(move || -> Result<u64> {
                let file = File::create(&out).with_context(|| format!("creating {}", out.display()))?;
                Ok(orchestrator.export_local(&source, &channel, BufWriter::new(file))?)
            })
            .await??;
            info!(size, "wrote repacked package");
        }
        Command::Materialize {
            src,
            cid,
            dest,
            workers,
            part_size,
            min_part_size
        } => {
            let source = ObjectRef::parse(&src)?;
            let channel = ChannelId::parse(&cid)?;
            let dest = ObjectRef::parse(&dest)?;
            let config = MultipartConfig {
                part_size,
                min_part_size,
                workers
            };
            let result = tokio::task::spawn_blocking(move || {
                orchestrator.materialize(&source, &channel, &dest, config)
            })
            .await??;
            info!(size = result.total_size(), "materialized repacked package");
        }
    }
    Ok(())
}
