//! # IPFIX Forwarding Engine - Demo Entry Point
//!
//! Thin binary around the forwarding core: parses CLI flags into a
//! [`ForwardingConfig`], installs a colorized `tracing` subscriber, builds a
//! [`ForwardingDispatcher`], and feeds it already-decoded message records
//! read from stdin using a small length-prefixed framing private to this
//! binary (real IPFIX message parsing stays an external collaborator per
//! spec.md section 1).
//!
//! ## Stdin framing
//!
//! Each record is:
//! `source(u64 BE) odid(u32 BE) export_time(u32 BE) item_count(u32 BE)`
//! followed by `item_count` items, each:
//! - tag `0`/`1` (Template Record, Normal/Options): `len(u32 BE)` then
//!   `len` bytes of the raw Template Record.
//! - tag `2` (Data Set): `flowset_id(u16 BE)`, `record_count(u32 BE)`,
//!   `len(u32 BE)` then `len` bytes of the full Data Set (including its own
//!   4-byte Set header).
//!
//! Reading stops cleanly at EOF.

use std::io::{self, Read};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, Level};

use ipfix_forward::cli::Args;
use ipfix_forward::dispatcher::IncomingItem;
use ipfix_forward::templates::TemplateType;
use ipfix_forward::ForwardingDispatcher;

fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    if !args.quiet {
        ipfix_forward::logging::init(level);
    }

    let config = args.build_config().context("invalid forwarding configuration")?;
    info!(
        distribution = ?config.distribution,
        destinations = config.destinations.len(),
        packet_size = config.packet_size,
        "starting forwarding engine"
    );

    let mut dispatcher = ForwardingDispatcher::new(&config);
    let mut stdin = io::stdin().lock();

    loop {
        let source = match read_u64(&mut stdin)? {
            Some(v) => v,
            None => break,
        };
        let odid = read_u32_required(&mut stdin)?;
        let export_time = read_u32_required(&mut stdin)?;
        let item_count = read_u32_required(&mut stdin)?;

        let mut raw_items = Vec::with_capacity(item_count as usize);
        for _ in 0..item_count {
            raw_items.push(read_raw_item(&mut stdin)?);
        }

        let items: Vec<IncomingItem<'_>> = raw_items.iter().map(RawItem::as_incoming).collect();
        dispatcher.dispatch(source, odid, export_time, &items);
    }

    info!("stdin closed, shutting down");
    Ok(())
}

/// An owned item read off stdin, kept separate from [`IncomingItem`] so the
/// whole batch can be read before any borrows into it are taken.
enum RawItem {
    TemplateRecord { bytes: Vec<u8>, ttype: TemplateType },
    DataSet { flowset_id: u16, bytes: Vec<u8>, record_count: u32 },
}

impl RawItem {
    fn as_incoming(&self) -> IncomingItem<'_> {
        match self {
            RawItem::TemplateRecord { bytes, ttype } => {
                IncomingItem::TemplateRecord { bytes, ttype: *ttype }
            }
            RawItem::DataSet { flowset_id, bytes, record_count } => {
                IncomingItem::DataSet { flowset_id: *flowset_id, bytes, record_count: *record_count }
            }
        }
    }
}

fn read_raw_item(r: &mut impl Read) -> Result<RawItem> {
    let tag = read_u8_required(r)?;
    match tag {
        0 | 1 => {
            let ttype = if tag == 0 { TemplateType::Normal } else { TemplateType::Options };
            let len = read_u32_required(r)?;
            let mut bytes = vec![0u8; len as usize];
            r.read_exact(&mut bytes).context("truncated template record")?;
            Ok(RawItem::TemplateRecord { bytes, ttype })
        }
        2 => {
            let flowset_id = read_u16_required(r)?;
            let record_count = read_u32_required(r)?;
            let len = read_u32_required(r)?;
            let mut bytes = vec![0u8; len as usize];
            r.read_exact(&mut bytes).context("truncated data set")?;
            Ok(RawItem::DataSet { flowset_id, bytes, record_count })
        }
        other => bail!("unknown item tag {other} in stdin framing"),
    }
}

fn read_u64(r: &mut impl Read) -> Result<Option<u64>> {
    let mut buf = [0u8; 8];
    match r.read_exact(&mut buf) {
        Ok(()) => Ok(Some(u64::from_be_bytes(buf))),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e).context("reading source id"),
    }
}

fn read_u32_required(r: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).context("truncated stream while reading a u32 field")?;
    Ok(u32::from_be_bytes(buf))
}

fn read_u16_required(r: &mut impl Read) -> Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf).context("truncated stream while reading a u16 field")?;
    Ok(u16::from_be_bytes(buf))
}

fn read_u8_required(r: &mut impl Read) -> Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf).context("truncated stream while reading a tag byte")?;
    Ok(buf[0])
}
