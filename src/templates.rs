//! # Template Manager
//!
//! Per-ODID shared Template ID space, reconciling each flow source's
//! private Template IDs into one shared space. Grounded on
//! `storage/forwarding/templates.c`: classification
//! (`tmplts_aux_def_type`), NEW/WITHDRAWAL/WITHDRAWAL_ALL resolution
//! (`fwd_src_add_tmplt`), free-ID allocation preferring the source's own
//! private ID (`fwd_odid_template_unused_id`), and withdrawal bookkeeping
//! (`fwd_odid_template_increment`/`_decrement`, `tmplts_withdraw_ids`).

use std::collections::HashMap;

use tracing::warn;

/// Observation Domain ID.
pub type Odid = u32;
/// A Template ID, shared or private; always >= 256 once valid.
pub type TemplateId = u16;
/// Opaque identity of a flow source, supplied by the caller.
pub type Source = u64;

const MIN_TEMPLATE_ID: u16 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateType {
    Normal,
    Options,
}

/// Outcome of [`TemplateManager::process_template`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult {
    /// Install this template under `new_id` in both builders.
    Pass(TemplateId),
    /// Nothing to forward: re-announcement, reconciled duplicate, consumed
    /// withdrawal, or capacity exhaustion.
    Drop,
    /// Malformed record; the caller should skip it.
    Invalid,
}

enum Classification {
    Invalid,
    WithdrawalAll,
    Withdrawal(TemplateId),
    New(TemplateId),
}

fn classify(rec: &[u8], expected_type: TemplateType) -> Classification {
    if rec.len() < 4 {
        return Classification::Invalid;
    }
    let id = u16::from_be_bytes([rec[0], rec[1]]);
    let count = u16::from_be_bytes([rec[2], rec[3]]);

    if count == 0 {
        if rec.len() != 4 {
            return Classification::Invalid;
        }
        if id == 2 && expected_type == TemplateType::Normal {
            return Classification::WithdrawalAll;
        }
        if id == 3 && expected_type == TemplateType::Options {
            return Classification::WithdrawalAll;
        }
        if id >= MIN_TEMPLATE_ID {
            return Classification::Withdrawal(id);
        }
        return Classification::Invalid;
    }

    if id >= MIN_TEMPLATE_ID {
        return Classification::New(id);
    }
    Classification::Invalid
}

/// Byte-identity ignoring the Template ID field (first two bytes).
fn templates_match(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a[2..] == b[2..]
}

struct SharedTemplate {
    ttype: TemplateType,
    bytes: Vec<u8>,
    ref_count: u32,
}

#[derive(Default)]
struct OdidStore {
    templates: HashMap<TemplateId, SharedTemplate>,
    normal_count: usize,
    options_count: usize,
    pending_withdrawal: usize,
}

impl OdidStore {
    fn is_empty(&self) -> bool {
        self.normal_count == 0 && self.options_count == 0
    }

    /// Prefers `hint` (the source's own private ID) if free, else scans the
    /// full shared space in ascending order.
    fn allocate_id(&self, hint: TemplateId) -> Option<TemplateId> {
        if hint >= MIN_TEMPLATE_ID && !self.templates.contains_key(&hint) {
            return Some(hint);
        }
        (MIN_TEMPLATE_ID..=u16::MAX).find(|id| !self.templates.contains_key(id))
    }

    fn find_identical(&self, ttype: TemplateType, rec: &[u8]) -> Option<TemplateId> {
        self.templates
            .iter()
            .find(|(_, t)| t.ttype == ttype && templates_match(&t.bytes, rec))
            .map(|(id, _)| *id)
    }
}

#[derive(Default)]
struct FlowSourceRecord {
    odid: Odid,
    mappings: HashMap<TemplateId, TemplateId>,
}

/// Reconciles per-source private Template IDs into a shared space, one
/// store per ODID. Not internally synchronized: per spec.md §5 the caller
/// (the dispatcher) must serialize all access.
#[derive(Default)]
pub struct TemplateManager {
    odids: HashMap<Odid, OdidStore>,
    sources: HashMap<Source, FlowSourceRecord>,
}

impl TemplateManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_or_create_source(&mut self, source: Source, odid: Odid) {
        self.odids.entry(odid).or_default();
        self.sources.entry(source).or_insert_with(|| FlowSourceRecord { odid, mappings: HashMap::new() });
    }

    /// Classifies and applies a raw Template Record from `source` within
    /// `odid`. See spec.md §4.3.2 for the full algorithm.
    pub fn process_template(
        &mut self,
        source: Source,
        odid: Odid,
        rec: &[u8],
        ttype: TemplateType,
    ) -> ProcessResult {
        self.get_or_create_source(source, odid);

        match classify(rec, ttype) {
            Classification::Invalid => ProcessResult::Invalid,
            Classification::New(private_id) => self.process_new(source, odid, private_id, rec, ttype),
            Classification::Withdrawal(private_id) => {
                self.remove_mapping(source, odid, private_id);
                ProcessResult::Drop
            }
            Classification::WithdrawalAll => {
                self.withdraw_all_of_type(source, odid, ttype);
                ProcessResult::Drop
            }
        }
    }

    fn process_new(
        &mut self,
        source: Source,
        odid: Odid,
        private_id: TemplateId,
        rec: &[u8],
        ttype: TemplateType,
    ) -> ProcessResult {
        if let Some(&shared_id) = self.sources[&source].mappings.get(&private_id) {
            let identical = self.odids[&odid]
                .templates
                .get(&shared_id)
                .map(|t| templates_match(&t.bytes, rec))
                .unwrap_or(false);
            if identical {
                return ProcessResult::Drop;
            }
            self.remove_mapping(source, odid, private_id);
        }

        if let Some(shared_id) = self.odids[&odid].find_identical(ttype, rec) {
            self.install_mapping(source, odid, private_id, shared_id);
            return ProcessResult::Drop;
        }

        let store = self.odids.get_mut(&odid).expect("odid store created above");
        let shared_id = match store.allocate_id(private_id) {
            Some(id) => id,
            None => {
                warn!(odid, "template ID space exhausted, dropping new template");
                return ProcessResult::Drop;
            }
        };

        let mut stored = rec.to_vec();
        stored[0..2].copy_from_slice(&shared_id.to_be_bytes());
        store.templates.insert(shared_id, SharedTemplate { ttype, bytes: stored, ref_count: 0 });
        match ttype {
            TemplateType::Normal => store.normal_count += 1,
            TemplateType::Options => store.options_count += 1,
        }

        self.install_mapping(source, odid, private_id, shared_id);
        ProcessResult::Pass(shared_id)
    }

    fn install_mapping(&mut self, source: Source, odid: Odid, private_id: TemplateId, shared_id: TemplateId) {
        self.sources.get_mut(&source).expect("source created above").mappings.insert(private_id, shared_id);
        let store = self.odids.get_mut(&odid).expect("odid store created above");
        if let Some(t) = store.templates.get_mut(&shared_id) {
            t.ref_count += 1;
            if t.ref_count == 1 {
                store.pending_withdrawal = store.pending_withdrawal.saturating_sub(1);
            }
        }
    }

    fn remove_mapping(&mut self, source: Source, odid: Odid, private_id: TemplateId) {
        let shared_id = match self.sources.get_mut(&source).and_then(|s| s.mappings.remove(&private_id)) {
            Some(id) => id,
            None => return,
        };
        let store = match self.odids.get_mut(&odid) {
            Some(s) => s,
            None => return,
        };
        if let Some(t) = store.templates.get_mut(&shared_id) {
            t.ref_count = t.ref_count.saturating_sub(1);
            if t.ref_count == 0 {
                store.pending_withdrawal += 1;
            }
        }
    }

    fn withdraw_all_of_type(&mut self, source: Source, odid: Odid, ttype: TemplateType) {
        let private_ids: Vec<TemplateId> = match self.sources.get(&source) {
            Some(s) => {
                let store = match self.odids.get(&odid) {
                    Some(s) => s,
                    None => return,
                };
                s.mappings
                    .iter()
                    .filter(|(_, shared_id)| store.templates.get(shared_id).map(|t| t.ttype) == Some(ttype))
                    .map(|(private_id, _)| *private_id)
                    .collect()
            }
            None => return,
        };
        for private_id in private_ids {
            self.remove_mapping(source, odid, private_id);
        }
    }

    /// Returns the shared ID mapped to `(source, flowset_id)`, or `0` if
    /// unknown.
    pub fn remap_data_set(&self, source: Source, flowset_id: TemplateId) -> TemplateId {
        self.sources
            .get(&source)
            .and_then(|s| s.mappings.get(&flowset_id))
            .copied()
            .unwrap_or(0)
    }

    /// Drains every shared template of `ttype` in `odid` whose ref-count is
    /// zero. Destroys the ODID store if it becomes empty of templates.
    pub fn take_withdrawals(&mut self, odid: Odid, ttype: TemplateType) -> Vec<TemplateId> {
        let store = match self.odids.get_mut(&odid) {
            Some(s) => s,
            None => return Vec::new(),
        };

        let ids: Vec<TemplateId> = store
            .templates
            .iter()
            .filter(|(_, t)| t.ttype == ttype && t.ref_count == 0)
            .map(|(id, _)| *id)
            .collect();

        for id in &ids {
            store.templates.remove(id);
            match ttype {
                TemplateType::Normal => store.normal_count -= 1,
                TemplateType::Options => store.options_count -= 1,
            }
            store.pending_withdrawal = store.pending_withdrawal.saturating_sub(1);
        }

        if store.is_empty() {
            self.odids.remove(&odid);
        }

        ids
    }

    /// Byte-for-byte shared template records of `ttype` in `odid`, for
    /// replay to a reconnected destination.
    pub fn templates_of(&self, odid: Odid, ttype: TemplateType) -> Vec<(TemplateId, Vec<u8>)> {
        match self.odids.get(&odid) {
            Some(store) => store
                .templates
                .iter()
                .filter(|(_, t)| t.ttype == ttype)
                .map(|(id, t)| (*id, t.bytes.clone()))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn odids(&self) -> Vec<Odid> {
        self.odids.keys().copied().collect()
    }

    /// Withdraws every mapping owned by `source` and deletes its record.
    pub fn remove_source(&mut self, source: Source) {
        if let Some(odid) = self.sources.get(&source).map(|s| s.odid) {
            self.withdraw_all_of_type(source, odid, TemplateType::Normal);
            self.withdraw_all_of_type(source, odid, TemplateType::Options);
        }
        self.sources.remove(&source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template_rec(id: u16, count: u16, field_bytes: &[u8]) -> Vec<u8> {
        let mut rec = Vec::new();
        rec.extend_from_slice(&id.to_be_bytes());
        rec.extend_from_slice(&count.to_be_bytes());
        rec.extend_from_slice(field_bytes);
        rec
    }

    #[test]
    fn classify_withdrawal_all_and_plain_withdrawal() {
        assert!(matches!(classify(&template_rec(2, 0, &[]), TemplateType::Normal), Classification::WithdrawalAll));
        assert!(matches!(classify(&template_rec(3, 0, &[]), TemplateType::Options), Classification::WithdrawalAll));
        assert!(matches!(classify(&template_rec(300, 0, &[]), TemplateType::Normal), Classification::Withdrawal(300)));
        assert!(matches!(classify(&template_rec(10, 0, &[]), TemplateType::Normal), Classification::Invalid));
    }

    #[test]
    fn classify_new_requires_id_in_range() {
        assert!(matches!(classify(&template_rec(256, 2, &[0, 1, 2, 3]), TemplateType::Normal), Classification::New(256)));
        assert!(matches!(classify(&template_rec(4, 2, &[0, 1, 2, 3]), TemplateType::Normal), Classification::Invalid));
        assert!(matches!(classify(&[0u8, 1], TemplateType::Normal), Classification::Invalid));
    }

    #[test]
    fn s1_new_template_gets_free_shared_id() {
        let mut mgr = TemplateManager::new();
        let rec = template_rec(256, 2, &[0, 4, 0, 4]);
        let result = mgr.process_template(1, 7, &rec, TemplateType::Normal);
        assert_eq!(result, ProcessResult::Pass(256));
        assert_eq!(mgr.remap_data_set(1, 256), 256);
    }

    #[test]
    fn s2_id_collision_across_sources_gets_distinct_shared_ids() {
        let mut mgr = TemplateManager::new();
        let rec_a = template_rec(256, 2, &[0, 4, 0, 4]);
        let rec_b = template_rec(256, 1, &[0, 8]);

        let a = mgr.process_template(1, 7, &rec_a, TemplateType::Normal);
        let b = mgr.process_template(2, 7, &rec_b, TemplateType::Normal);

        assert_eq!(a, ProcessResult::Pass(256));
        assert_eq!(b, ProcessResult::Pass(257));
        assert_eq!(mgr.remap_data_set(1, 256), 256);
        assert_eq!(mgr.remap_data_set(2, 256), 257);
    }

    #[test]
    fn s3_duplicate_reannouncement_is_dropped() {
        let mut mgr = TemplateManager::new();
        let rec = template_rec(256, 2, &[0, 4, 0, 4]);
        assert_eq!(mgr.process_template(1, 7, &rec, TemplateType::Normal), ProcessResult::Pass(256));
        assert_eq!(mgr.process_template(1, 7, &rec, TemplateType::Normal), ProcessResult::Drop);
    }

    #[test]
    fn s4_withdrawal_then_reuse_of_the_freed_id() {
        let mut mgr = TemplateManager::new();
        let rec = template_rec(256, 2, &[0, 4, 0, 4]);
        assert_eq!(mgr.process_template(1, 7, &rec, TemplateType::Normal), ProcessResult::Pass(256));

        let withdrawal = template_rec(256, 0, &[]);
        assert_eq!(mgr.process_template(1, 7, &withdrawal, TemplateType::Normal), ProcessResult::Drop);

        let withdrawn = mgr.take_withdrawals(7, TemplateType::Normal);
        assert_eq!(withdrawn, vec![256]);
        assert!(mgr.take_withdrawals(7, TemplateType::Normal).is_empty());

        let rec2 = template_rec(256, 2, &[0, 4, 0, 4]);
        assert_eq!(mgr.process_template(1, 7, &rec2, TemplateType::Normal), ProcessResult::Pass(256));
    }

    #[test]
    fn remove_source_withdraws_everything() {
        let mut mgr = TemplateManager::new();
        let rec = template_rec(256, 2, &[0, 4, 0, 4]);
        mgr.process_template(1, 7, &rec, TemplateType::Normal);
        mgr.remove_source(1);
        assert_eq!(mgr.take_withdrawals(7, TemplateType::Normal), vec![256]);
        assert!(mgr.odids().is_empty());
    }
}
