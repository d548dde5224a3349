//! End-to-end scenarios S1-S4 from spec.md section 8, exercised against the
//! public `TemplateManager` API.

use ipfix_forward::templates::{ProcessResult, TemplateManager, TemplateType};

fn template_rec(private_id: u16, count: u16, fields: &[u8]) -> Vec<u8> {
    let mut rec = Vec::new();
    rec.extend_from_slice(&private_id.to_be_bytes());
    rec.extend_from_slice(&count.to_be_bytes());
    rec.extend_from_slice(fields);
    rec
}

/// S1 - new template flow: a fresh private ID on a fresh ODID gets the same
/// shared ID back (it was free), and subsequent Data Set remapping resolves
/// to it.
#[test]
fn s1_new_template_flow() {
    let mut mgr = TemplateManager::new();
    let rec = template_rec(256, 2, &[0, 4, 0, 4]);

    let result = mgr.process_template(1, 7, &rec, TemplateType::Normal);
    assert_eq!(result, ProcessResult::Pass(256));
    assert_eq!(mgr.remap_data_set(1, 256), 256);
}

/// S2 - ID collision across sources sharing one ODID: both sources claim
/// private_id=256 for different template bodies, so the second gets a
/// distinct shared ID and both coexist.
#[test]
fn s2_id_collision_across_sources() {
    let mut mgr = TemplateManager::new();
    let rec_a = template_rec(256, 2, &[0, 4, 0, 4]);
    let rec_b = template_rec(256, 1, &[0, 8]);

    let a = mgr.process_template(1, 7, &rec_a, TemplateType::Normal);
    let b = mgr.process_template(2, 7, &rec_b, TemplateType::Normal);

    assert_eq!(a, ProcessResult::Pass(256));
    assert_eq!(b, ProcessResult::Pass(257));
    assert_eq!(mgr.remap_data_set(1, 256), 256);
    assert_eq!(mgr.remap_data_set(2, 256), 257);
    assert_ne!(mgr.remap_data_set(1, 256), mgr.remap_data_set(2, 256));
}

/// S3 - duplicate re-announcement of the exact same Template Record from
/// the same source is dropped and leaves the mapping/ref-count untouched.
#[test]
fn s3_duplicate_reannouncement_is_dropped() {
    let mut mgr = TemplateManager::new();
    let rec = template_rec(256, 2, &[0, 4, 0, 4]);

    assert_eq!(mgr.process_template(1, 7, &rec, TemplateType::Normal), ProcessResult::Pass(256));
    assert_eq!(mgr.process_template(1, 7, &rec, TemplateType::Normal), ProcessResult::Drop);
    // Still resolves the same way; no duplicate bytes were ever installed.
    assert_eq!(mgr.remap_data_set(1, 256), 256);
}

/// S4 - withdrawal then reuse: withdrawing a template frees its shared ID
/// for a later, unrelated template from the same source.
#[test]
fn s4_withdrawal_then_reuse_of_freed_id() {
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

/// Invariant 2 (spec.md section 8): the sum of live mappings pointing at a
/// shared template always equals that template's ref-count, as observed
/// through withdrawal behavior - a template referenced by two sources isn't
/// eligible for withdrawal until both release it.
#[test]
fn ref_counted_template_survives_until_every_source_releases_it() {
    let mut mgr = TemplateManager::new();
    let rec = template_rec(300, 3, &[0, 4, 0, 4, 0, 4]);

    assert_eq!(mgr.process_template(1, 9, &rec, TemplateType::Normal), ProcessResult::Pass(300));
    // Source 2 announces the identical body under the same private ID: it
    // reconciles onto the existing shared template rather than allocating
    // a second one.
    assert_eq!(mgr.process_template(2, 9, &rec, TemplateType::Normal), ProcessResult::Drop);

    let withdraw_src1 = template_rec(300, 0, &[]);
    mgr.process_template(1, 9, &withdraw_src1, TemplateType::Normal);
    // Source 2 still references it, so it must not be withdrawn yet.
    assert!(mgr.take_withdrawals(9, TemplateType::Normal).is_empty());

    let withdraw_src2 = template_rec(300, 0, &[]);
    mgr.process_template(2, 9, &withdraw_src2, TemplateType::Normal);
    assert_eq!(mgr.take_withdrawals(9, TemplateType::Normal), vec![300]);
}
