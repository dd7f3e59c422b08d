//! Partition document decoding, flattening into per-entity candidates, and natural-key dedup.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::Serialize;
use tdw_core::{
    AddressRow, Amount, BonusCandidate, BonusDurationRow, ConnectivityTypeRow, DocumentTariff,
    EntityKind, NaturalKey, OfferCandidate, ProviderRow, TariffBonusLinkCandidate,
    TariffCandidate, TariffDocument, TariffTerms,
};
use thiserror::Error;

pub const CRATE_NAME: &str = "tdw-adapters";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("partition document is empty")]
    Empty,
    #[error("record {record} is not a valid tariff document: {source}")]
    Record {
        record: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Decode a landed partition file. Accepts a single JSON object, a JSON array
/// of objects, or newline-delimited objects.
pub fn decode_documents(bytes: &[u8]) -> Result<Vec<TariffDocument>, DecodeError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let first = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .ok_or(DecodeError::Empty)?;

    if bytes[first] == b'[' {
        return serde_json::from_slice(&bytes[first..])
            .map_err(|source| DecodeError::Record { record: 0, source });
    }

    serde_json::Deserializer::from_slice(&bytes[first..])
        .into_iter::<TariffDocument>()
        .enumerate()
        .map(|(record, doc)| doc.map_err(|source| DecodeError::Record { record, source }))
        .collect()
}

/// Keep the first row observed for each natural key, in observation order.
pub fn dedup_by_natural_key<T: NaturalKey>(rows: impl IntoIterator<Item = T>) -> Vec<T> {
    let mut seen = BTreeSet::new();
    rows.into_iter()
        .filter(|row| seen.insert(row.natural_key()))
        .collect()
}

pub fn tariff_candidate(tariff: &DocumentTariff) -> TariffCandidate {
    TariffCandidate {
        tariff_name: tariff.name.clone(),
        provider_name: tariff.provider.clone(),
        connectivity_name: tariff.connectivity.clone(),
        terms: TariffTerms {
            nominal_price: tariff.price.nominal_price.map(Amount),
            discounted_price: tariff.price.discounted_price.map(Amount),
            contract_duration: tariff.contract_details.runtime,
            upload_rate: tariff.contract_details.ul_max.map(Amount),
            download_rate: tariff.contract_details.dl_max.map(Amount),
        },
    }
}

fn address_row(doc: &TariffDocument) -> AddressRow {
    AddressRow {
        street: doc.address.street.clone(),
        city: doc.address.city.clone(),
        zip: doc.address.postal_code.clone(),
    }
}

/// Expands partition documents into lazy per-entity candidate sequences.
///
/// Addresses, providers and connectivity types are reference data and are
/// extracted from every record. Tariffs, bonuses, links and offers are facts
/// of the partition and only come from records dated on the partition date.
#[derive(Debug, Clone, Copy)]
pub struct DocumentFlattener<'a> {
    documents: &'a [TariffDocument],
    partition_date: NaiveDate,
}

impl<'a> DocumentFlattener<'a> {
    pub fn new(documents: &'a [TariffDocument], partition_date: NaiveDate) -> Self {
        Self {
            documents,
            partition_date,
        }
    }

    fn all_tariffs(&self) -> impl Iterator<Item = (&'a TariffDocument, &'a DocumentTariff)> + 'a {
        self.documents
            .iter()
            .flat_map(|doc| doc.tarifs.iter().map(move |tariff| (doc, tariff)))
    }

    fn dated_documents(&self) -> impl Iterator<Item = &'a TariffDocument> + 'a {
        let partition_date = self.partition_date;
        self.documents
            .iter()
            .filter(move |doc| doc.date == partition_date)
    }

    fn dated_tariffs(&self) -> impl Iterator<Item = (&'a TariffDocument, &'a DocumentTariff)> + 'a {
        self.dated_documents()
            .flat_map(|doc| doc.tarifs.iter().map(move |tariff| (doc, tariff)))
    }

    pub fn addresses(&self) -> impl Iterator<Item = AddressRow> + 'a {
        self.documents.iter().map(address_row)
    }

    pub fn providers(&self) -> impl Iterator<Item = ProviderRow> + 'a {
        self.all_tariffs().map(|(doc, tariff)| ProviderRow {
            provider_name: tariff.provider.clone(),
            provider_source: doc.source.clone(),
        })
    }

    pub fn connectivity_types(&self) -> impl Iterator<Item = ConnectivityTypeRow> + 'a {
        self.all_tariffs().map(|(_, tariff)| ConnectivityTypeRow {
            connectivity_name: tariff.connectivity.clone(),
        })
    }

    pub fn tariffs(&self) -> impl Iterator<Item = TariffCandidate> + 'a {
        self.dated_tariffs().map(|(_, tariff)| tariff_candidate(tariff))
    }

    pub fn bonus_durations(&self) -> impl Iterator<Item = BonusDurationRow> + 'a {
        self.dated_tariffs()
            .flat_map(|(_, tariff)| tariff.bonis.iter())
            .filter_map(|bonus| bonus.duration)
            .map(|bonus_duration| BonusDurationRow { bonus_duration })
    }

    /// Entries without a duration are dropped here, before dedup, so a keyed
    /// copy with a duration elsewhere in the partition is the one kept.
    pub fn bonuses(&self) -> impl Iterator<Item = BonusCandidate> + 'a {
        self.dated_tariffs()
            .flat_map(|(_, tariff)| tariff.bonis.iter())
            .filter_map(|bonus| {
                Some(BonusCandidate {
                    bonus_name: bonus.name.clone(),
                    bonus_value: bonus.value.map(Amount),
                    bonus_duration: bonus.duration?,
                })
            })
    }

    pub fn tariff_bonus_links(&self) -> impl Iterator<Item = TariffBonusLinkCandidate> + 'a {
        self.dated_tariffs().flat_map(|(_, tariff)| {
            let candidate = tariff_candidate(tariff);
            tariff.bonis.iter().map(move |bonus| TariffBonusLinkCandidate {
                tariff: candidate.clone(),
                bonus: tdw_core::BonusKey {
                    bonus_name: bonus.name.clone(),
                    bonus_value: bonus.value.map(Amount),
                },
            })
        })
    }

    pub fn offers(&self) -> impl Iterator<Item = OfferCandidate> + 'a {
        self.dated_tariffs().map(|(doc, tariff)| OfferCandidate {
            address: address_row(doc),
            tariff: tariff_candidate(tariff),
            date_collected: doc.date,
        })
    }
}

/// Distinct candidate rows for every entity of one partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CandidateSet {
    pub addresses: Vec<AddressRow>,
    pub providers: Vec<ProviderRow>,
    pub connectivity_types: Vec<ConnectivityTypeRow>,
    pub tariffs: Vec<TariffCandidate>,
    pub bonus_durations: Vec<BonusDurationRow>,
    pub bonuses: Vec<BonusCandidate>,
    pub tariff_bonus_links: Vec<TariffBonusLinkCandidate>,
    pub offers: Vec<OfferCandidate>,
}

impl CandidateSet {
    pub fn from_documents(documents: &[TariffDocument], partition_date: NaiveDate) -> Self {
        let flat = DocumentFlattener::new(documents, partition_date);
        Self {
            addresses: dedup_by_natural_key(flat.addresses()),
            providers: dedup_by_natural_key(flat.providers()),
            connectivity_types: dedup_by_natural_key(flat.connectivity_types()),
            tariffs: dedup_by_natural_key(flat.tariffs()),
            bonus_durations: dedup_by_natural_key(flat.bonus_durations()),
            bonuses: dedup_by_natural_key(flat.bonuses()),
            tariff_bonus_links: dedup_by_natural_key(flat.tariff_bonus_links()),
            offers: dedup_by_natural_key(flat.offers()),
        }
    }

    pub fn len_of(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::Address => self.addresses.len(),
            EntityKind::Provider => self.providers.len(),
            EntityKind::ConnectivityType => self.connectivity_types.len(),
            EntityKind::Tariff => self.tariffs.len(),
            EntityKind::BonusDuration => self.bonus_durations.len(),
            EntityKind::Bonus => self.bonuses.len(),
            EntityKind::TariffBonusLink => self.tariff_bonus_links.len(),
            EntityKind::Offer => self.offers.len(),
        }
    }

    pub fn counts(&self) -> BTreeMap<EntityKind, usize> {
        EntityKind::ALL
            .iter()
            .map(|kind| (*kind, self.len_of(*kind)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        EntityKind::ALL.iter().all(|kind| self.len_of(*kind) == 0)
    }
}
