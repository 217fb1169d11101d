use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use matter_fabric::{
    ca::CertificateAuthority,
    case::RequestOutcome,
    config::{self, CoreConfig},
    context::CoreContext,
    fabric::{FabricIndex, FabricInfo},
    storage::FileStorage,
};

const DEFAULT_FABRIC: u64 = 0x110;
const DEFAULT_CA_PATH: &str = "./ca";
const DEFAULT_KVS_PATH: &str = "./kvs";
/// Epoch key used by the demo to derive IPKs.
const DEMO_EPOCH_KEY: [u8; 16] = *b"demo epoch key!!";

#[derive(Parser, Debug)]
#[command()]
struct Cli {
    #[clap(long)]
    #[arg(global = true, default_value_t = false)]
    verbose: bool,

    #[clap(long)]
    #[arg(global = true, default_value_t = DEFAULT_CA_PATH.to_string())]
    ca_path: String,

    #[clap(long)]
    #[arg(global = true, default_value_t = DEFAULT_KVS_PATH.to_string())]
    kvs_path: String,

    /// JSON configuration; defaults are used when not given
    #[clap(long)]
    #[arg(global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize CA - generate root (and optionally intermediate) keys and certificates
    CaBootstrap {
        #[clap(long)]
        #[arg(default_value_t = DEFAULT_FABRIC)]
        fabric_id: u64,

        #[clap(long)]
        #[arg(default_value_t = false)]
        icac: bool,
    },
    /// Issue NOC for node and add it as new fabric into local storage
    AddFabric {
        node_id: u64,

        #[clap(long)]
        #[arg(default_value_t = String::new())]
        label: String,
    },
    ListFabrics {},
    RemoveFabric {
        index: FabricIndex,
    },
    SetLabel {
        index: FabricIndex,
        label: String,
    },
    /// Run session establishment between fabric in kvs-path and fabric in peer storage
    Case {
        index: FabricIndex,
        peer_kvs_path: String,
        peer_index: FabricIndex,
    },
    /// Write default configuration to file
    WriteConfig {
        path: String,
    },
}

fn create_context(kvs_path: &str, config_path: Option<&str>) -> Result<CoreContext> {
    let config = match config_path {
        Some(p) => config::load_config(Path::new(p))?,
        None => CoreConfig::default(),
    };
    let storage = Arc::new(FileStorage::new(Path::new(kvs_path))?);
    CoreContext::new(config, storage)
}

fn fabric(ctx: &CoreContext, index: FabricIndex) -> Result<&FabricInfo> {
    ctx.fabrics
        .fabric(index)
        .with_context(|| format!("no fabric at index {}", index))
}

fn add_fabric(ctx: &mut CoreContext, ca_path: &str, node_id: u64, label: &str) -> Result<()> {
    let ca = CertificateAuthority::load(Path::new(ca_path))?;
    let node = ca.issue_node(node_id)?;
    let mut candidate = FabricInfo::new();
    candidate.set_operational_key(node.keypair.clone());
    candidate.set_root_cert(ca.root_cert())?;
    candidate.set_operational_certs_from_cert_array(&node.op_cert_array()?)?;
    candidate.set_label(label)?;
    let index = ctx.fabrics.add_new_fabric(&mut candidate)?;
    let f = fabric(ctx, index)?;
    println!(
        "fabric index {} fabric id 0x{:x} node id 0x{:x} compressed fabric id {:016x}",
        index,
        f.fabric_id(),
        f.node_id(),
        f.compressed_fabric_id()?
    );
    Ok(())
}

fn run_case(ctx: &mut CoreContext, index: FabricIndex, peer: &mut CoreContext, peer_index: FabricIndex) -> Result<()> {
    let sid = ctx.sessions.allocate_key_id()?;
    let peer_sid = peer.sessions.allocate_key_id()?;
    let local = fabric(ctx, index)?;
    let ipk = local.derive_operational_ipk(&DEMO_EPOCH_KEY)?;
    let (peer_ipk, peer_node_id) = {
        let remote = fabric(peer, peer_index)?;
        (remote.derive_operational_ipk(&DEMO_EPOCH_KEY)?, remote.node_id())
    };

    let mut init = ctx.case_initiator();
    let mut resp = peer.case_responder();

    let mut req = init.begin_request(local, &ipk, peer_node_id, sid)?;
    if let RequestOutcome::Reconfigure(msg) = resp.process_begin_request(&req, &mut peer.fabrics, &[&peer_ipk], peer_sid)? {
        println!("responder asked to reconfigure");
        init.process_reconfigure(&msg)?;
        init.reconfigure()?;
        req = init.begin_request(local, &ipk, peer_node_id, sid)?;
        resp.process_begin_request(&req, &mut peer.fabrics, &[&peer_ipk], peer_sid)?;
    }
    let rsp = resp.begin_response(fabric(peer, peer_index)?)?;
    init.process_begin_response(&rsp, local)?;
    if init.key_confirm_negotiated() {
        let kc = init.key_confirm()?;
        resp.process_key_confirm(&kc)?;
    }
    println!(
        "established with protocol config {} key confirmation {}",
        init.protocol_config(),
        init.key_confirm_negotiated()
    );
    ctx.commit_case(&mut init)?;
    peer.commit_case(&mut resp)?;

    let (counter, sealed) = ctx.sessions.seal(sid, &[], b"hello")?;
    let opened = peer.sessions.open(peer_sid, counter, &[], &sealed)?;
    println!(
        "session {} -> {} counter {} payload {:?}",
        sid,
        peer_sid,
        counter,
        String::from_utf8_lossy(&opened)
    );
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = {
        if cli.verbose {
            log::LevelFilter::Trace
        } else {
            log::LevelFilter::Error
        }
    };
    env_logger::Builder::new()
        .parse_default_env()
        .target(env_logger::Target::Stdout)
        .filter_level(log_level)
        .format_line_number(true)
        .format_file(true)
        .format_timestamp(Some(env_logger::TimestampPrecision::Millis))
        .init();

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::CaBootstrap { fabric_id, icac } => {
            let mut ca = CertificateAuthority::new(fabric_id, 1)?;
            if icac {
                ca.add_intermediate(2)?;
            }
            ca.save(Path::new(&cli.ca_path))?;
        }
        Commands::AddFabric { node_id, label } => {
            let mut ctx = create_context(&cli.kvs_path, config_path)?;
            add_fabric(&mut ctx, &cli.ca_path, node_id, &label)?;
        }
        Commands::ListFabrics {} => {
            let ctx = create_context(&cli.kvs_path, config_path)?;
            for f in ctx.fabrics.iter() {
                println!("{:?}", f.descriptor());
            }
        }
        Commands::RemoveFabric { index } => {
            let mut ctx = create_context(&cli.kvs_path, config_path)?;
            ctx.remove_fabric(index)?;
        }
        Commands::SetLabel { index, label } => {
            let mut ctx = create_context(&cli.kvs_path, config_path)?;
            ctx.fabrics.set_fabric_label(index, &label)?;
        }
        Commands::Case {
            index,
            peer_kvs_path,
            peer_index,
        } => {
            let mut ctx = create_context(&cli.kvs_path, config_path)?;
            let mut peer = create_context(&peer_kvs_path, config_path)?;
            run_case(&mut ctx, index, &mut peer, peer_index)?;
        }
        Commands::WriteConfig { path } => {
            config::save_config(Path::new(&path), &CoreConfig::default())?;
        }
    }
    Ok(())
}
