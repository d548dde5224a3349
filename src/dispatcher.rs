//! # Forwarding Dispatcher
//!
//! Thin driver tying the [`TemplateManager`], the two
//! [`PacketBuilder`]s (all-content and templates-only), and the
//! [`DestinationManager`] together. Grounded on `storage/forwarding/forwarding.c`:
//! `fwd_process_template_set`, `fwd_process_data_set`,
//! `fwd_process_withdrawals`, `storage_init`/`store_packet`.
//!
//! IPFIX message parsing stays an external collaborator (spec.md §1): this
//! module accepts an already-decoded list of [`IncomingItem`]s rather than
//! raw datagram bytes.

use tracing::warn;

use crate::config::{Distribution, ForwardingConfig};
use crate::destination::DestinationManager;
use crate::packet::PacketBuilder;
use crate::templates::{Odid, ProcessResult, Source, TemplateManager, TemplateType};

/// One decoded item from an inbound IPFIX message: either a single
/// Template Record (already split out of its containing Template Set by
/// the external parser) or a whole Data Set.
pub enum IncomingItem<'a> {
    TemplateRecord { bytes: &'a [u8], ttype: TemplateType },
    DataSet { flowset_id: u16, bytes: &'a [u8], record_count: u32 },
}

/// Composition root: owns the template manager and the destination
/// manager, and drives one dispatch per inbound message.
pub struct ForwardingDispatcher {
    templates: TemplateManager,
    destinations: DestinationManager,
    distribution: Distribution,
    packet_size: u16,
}

impl ForwardingDispatcher {
    pub fn new(config: &ForwardingConfig) -> Self {
        let destinations = config
            .destinations
            .iter()
            .map(|d| (d.host.clone(), d.port_or_default(&config.default_port)))
            .collect();

        Self {
            templates: TemplateManager::new(),
            destinations: DestinationManager::new(destinations, config.reconnection_period),
            distribution: config.distribution,
            packet_size: config.packet_size,
        }
    }

    /// Processes one inbound IPFIX message: consults the template manager
    /// for every Template Record and Data Set, appends withdrawals, and
    /// hands the finalized packets to the destination manager.
    pub fn dispatch<'a>(&mut self, source: Source, odid: Odid, export_time: u32, items: &[IncomingItem<'a>]) {
        self.destinations.promote_ready(&self.templates);

        let mut builder_all = PacketBuilder::new();
        let mut builder_templates = PacketBuilder::new();
        builder_all.start(odid, export_time);
        builder_templates.start(odid, export_time);

        let mut saw_template = false;

        for item in items {
            match item {
                IncomingItem::TemplateRecord { bytes, ttype } => {
                    saw_template = true;
                    match self.templates.process_template(source, odid, bytes, *ttype) {
                        ProcessResult::Pass(new_id) => {
                            builder_all.add_template(bytes, new_id, *ttype);
                            builder_templates.add_template(bytes, new_id, *ttype);
                        }
                        ProcessResult::Drop => {}
                        ProcessResult::Invalid => {
                            warn!(odid, "malformed template record, dropped");
                        }
                    }
                }
                IncomingItem::DataSet { flowset_id, bytes, record_count } => {
                    if *flowset_id < 256 {
                        warn!(odid, flowset_id, "data set flowset_id below 256, dropped");
                        continue;
                    }
                    let new_id = self.templates.remap_data_set(source, *flowset_id);
                    if new_id == 0 {
                        warn!(odid, flowset_id, "unknown template for data set, dropped");
                        continue;
                    }
                    builder_all.add_data_set(bytes, new_id, *record_count);
                }
            }
        }

        if saw_template {
            for ttype in [TemplateType::Normal, TemplateType::Options] {
                for id in self.templates.take_withdrawals(odid, ttype) {
                    builder_all.add_template_withdrawal(id, ttype);
                    builder_templates.add_template_withdrawal(id, ttype);
                }
            }
        }

        builder_all.end(self.packet_size);
        builder_templates.end(self.packet_size);

        self.destinations.send(&mut builder_all, &mut builder_templates, self.distribution);
    }

    /// Withdraws every template mapping owned by `source` and forgets it.
    /// Does not itself forward the resulting withdrawals; call `dispatch`
    /// with an empty item list afterwards (or let the next message's
    /// withdrawal scan pick them up) to flush them to destinations.
    pub fn remove_source(&mut self, source: Source) {
        self.templates.remove_source(source);
    }
}
