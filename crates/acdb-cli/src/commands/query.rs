//! Read-only key-vector queries against a chunked ACDB file.

use std::path::PathBuf;

use acdb_core::{CalKeyVector, ChunkedFile, GraphKeyVector, Resolver, TagId};
use clap::{Args, Subcommand};

use super::common::{parse_key_vector, parse_sg_ids};

#[derive(Args)]
pub struct QueryArgs {
    /// Path to the chunked `.acdb` database file.
    #[arg(short, long)]
    file: PathBuf,

    #[command(subcommand)]
    command: QueryCommand,
}

#[derive(Subcommand)]
enum QueryCommand {
    /// Subgraph list and connections for a topology (`get_graph`).
    Graph {
        /// GKV as comma-separated `key=value` pairs.
        #[arg(long, value_parser = parse_key_vector, default_value = "")]
        gkv: Vec<acdb_core::KeyValue>,
    },

    /// Calibration records for a subgraph set (`get_nonpersist_cal`).
    NonpersistCal {
        /// Comma-separated subgraph IDs.
        #[arg(long, value_parser = parse_sg_ids)]
        sg_ids: Vec<acdb_core::SubgraphId>,

        /// CKV as comma-separated `key=value` pairs.
        #[arg(long, value_parser = parse_key_vector, default_value = "")]
        ckv: Vec<acdb_core::KeyValue>,
    },

    /// `(cal_id, iid[])` pairs for a subgraph set (`get_persist_cal_ids`).
    PersistCalIds {
        #[arg(long, value_parser = parse_sg_ids)]
        sg_ids: Vec<acdb_core::SubgraphId>,

        #[arg(long, value_parser = parse_key_vector, default_value = "")]
        ckv: Vec<acdb_core::KeyValue>,
    },

    /// Every GKV whose key set is a superset of the given keys
    /// (`get_supported_gkvs`).
    SupportedGkvs {
        /// Comma-separated key IDs.
        #[arg(long, value_delimiter = ',')]
        keys: Vec<u32>,
    },

    /// `(mid, iid)` pairs tagged with `tag_id` (`get_tagged_modules`).
    TaggedModules {
        #[arg(long, value_parser = parse_sg_ids)]
        sg_ids: Vec<acdb_core::SubgraphId>,

        #[arg(long)]
        tag_id: u32,

        #[arg(long, default_value_t = 0)]
        proc_domain: u8,
    },
}

pub fn run(args: QueryArgs) -> anyhow::Result<()> {
    let file = ChunkedFile::open(&args.file)?;
    let resolver = Resolver::new(file);

    match args.command {
        QueryCommand::Graph { gkv } => {
            let gkv = GraphKeyVector::new(gkv);
            let graph = resolver.get_graph(&gkv)?;
            println!("subgraphs: {:?}", graph.sg_ids);
            for conn in &graph.connections {
                println!(
                    "  {} -> {} ({} bytes)",
                    conn.src_sg_id,
                    conn.dst_sg_id,
                    conn.payload.len()
                );
            }
        }
        QueryCommand::NonpersistCal { sg_ids, ckv } => {
            let ckv = CalKeyVector::new(ckv);
            let records = resolver.get_nonpersist_cal(&sg_ids, &CalKeyVector::default(), &ckv)?;
            for rec in &records {
                println!(
                    "iid={:#x} pid={:#x} errcode={} ({} bytes)",
                    rec.iid,
                    rec.pid,
                    rec.errcode,
                    rec.payload.len()
                );
            }
        }
        QueryCommand::PersistCalIds { sg_ids, ckv } => {
            let ckv = CalKeyVector::new(ckv);
            let rows = resolver.get_persist_cal_ids(&sg_ids, &ckv)?;
            for row in &rows {
                println!("cal_id={:#x} iids={:?}", row.cal_id, row.iids);
            }
        }
        QueryCommand::SupportedGkvs { keys } => {
            for gkv in resolver.get_supported_gkvs(&keys)? {
                println!("{gkv}");
            }
        }
        QueryCommand::TaggedModules {
            sg_ids,
            tag_id,
            proc_domain,
        } => {
            let modules = resolver.get_tagged_modules(&sg_ids, TagId(tag_id), proc_domain)?;
            for m in &modules {
                println!("module_id={:#x} instance_id={:#x}", m.module_id, m.instance_id);
            }
        }
    }

    Ok(())
}
