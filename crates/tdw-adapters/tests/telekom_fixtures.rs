use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tdw_adapters::{decode_documents, CandidateSet};
use tdw_core::{Amount, EntityKind};

fn fixture(date: &str) -> PathBuf {
    let (y, rest) = date.split_at(4);
    let m = &rest[1..3];
    let d = &rest[4..6];
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/staging")
        .join(format!("yyyy={y}/mm={m}/dd={d}/telekom.json"))
}

fn candidates(date: &str) -> CandidateSet {
    let bytes = std::fs::read(fixture(date)).expect("fixture");
    let docs = decode_documents(&bytes).expect("decode");
    CandidateSet::from_documents(&docs, NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap())
}

#[test]
fn single_tariff_sample_yields_one_candidate_per_entity() {
    let set = candidates("2025-02-05");
    for kind in EntityKind::ALL {
        assert_eq!(set.len_of(kind), 1, "{kind}");
    }
    assert_eq!(set.addresses[0].zip, "80333");
    assert_eq!(set.bonus_durations[0].bonus_duration, 12);
    assert_eq!(set.tariffs[0].terms.download_rate, Some(Amount(100.0)));
}

#[test]
fn multi_record_sample_flattens_and_dedups_across_records() {
    let set = candidates("2025-02-06");
    assert_eq!(set.addresses.len(), 2);
    assert_eq!(set.providers.len(), 1);
    assert_eq!(set.connectivity_types.len(), 2);
    assert_eq!(set.tariffs.len(), 2);
    assert_eq!(set.bonus_durations.len(), 2);
    assert_eq!(set.bonuses.len(), 2);
    assert_eq!(set.tariff_bonus_links.len(), 4);
    assert_eq!(set.offers.len(), 3);
}

#[test]
fn sample_read_under_another_partition_date_keeps_reference_data_only() {
    let bytes = std::fs::read(fixture("2025-02-05")).expect("fixture");
    let docs = decode_documents(&bytes).expect("decode");
    let set = CandidateSet::from_documents(&docs, NaiveDate::from_ymd_opt(2025, 2, 6).unwrap());

    assert_eq!(set.len_of(EntityKind::Address), 1);
    assert_eq!(set.len_of(EntityKind::Provider), 1);
    assert_eq!(set.len_of(EntityKind::ConnectivityType), 1);
    assert_eq!(set.len_of(EntityKind::Tariff), 0);
    assert_eq!(set.len_of(EntityKind::Offer), 0);
}
