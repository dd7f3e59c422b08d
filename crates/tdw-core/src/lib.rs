//! Core domain model for TDW: partition documents, warehouse entities and their natural keys.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::NaiveDate;
use serde::{de, Deserialize, Deserializer, Serialize};

pub const CRATE_NAME: &str = "tdw-core";

/// Warehouse-generated identifier of a merged row.
pub type SurrogateId = i64;

/// Exact-value float used inside natural keys.
///
/// Two amounts are equal when their values are identical; `-0.0` and `0.0`
/// compare equal so a sign flip in the source never forks a tariff.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(pub f64);

impl Amount {
    pub fn value(self) -> f64 {
        self.0
    }

    fn canonical(self) -> f64 {
        if self.0 == 0.0 {
            0.0
        } else {
            self.0
        }
    }
}

impl From<f64> for Amount {
    fn from(value: f64) -> Self {
        Self(value)
    }
}

impl PartialEq for Amount {
    fn eq(&self, other: &Self) -> bool {
        self.canonical().to_bits() == other.canonical().to_bits()
    }
}

impl Eq for Amount {}

impl Hash for Amount {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical().to_bits().hash(state);
    }
}

impl PartialOrd for Amount {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Amount {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical().total_cmp(&other.canonical())
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One record of a partition document as landed in the stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TariffDocument {
    pub date: NaiveDate,
    pub source: String,
    pub address: DocumentAddress,
    #[serde(default)]
    pub tarifs: Vec<DocumentTariff>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentAddress {
    pub street: String,
    pub city: String,
    #[serde(deserialize_with = "string_or_number")]
    pub postal_code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentTariff {
    pub provider: String,
    #[serde(rename = "type")]
    pub connectivity: String,
    pub name: String,
    #[serde(default)]
    pub price: DocumentPrice,
    #[serde(default)]
    pub contract_details: ContractDetails,
    #[serde(default)]
    pub bonis: Vec<DocumentBonus>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DocumentPrice {
    pub nominal_price: Option<f64>,
    pub discounted_price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContractDetails {
    /// Contract runtime in months.
    pub runtime: Option<i32>,
    pub ul_max: Option<f64>,
    pub dl_max: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentBonus {
    pub name: String,
    pub value: Option<f64>,
    pub duration: Option<i32>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    struct StringOrNumber;

    impl de::Visitor<'_> for StringOrNumber {
        type Value = String;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a string or a number")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_string<E: de::Error>(self, v: String) -> Result<String, E> {
            Ok(v)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<String, E> {
            Ok(v.to_string())
        }
    }

    deserializer.deserialize_any(StringOrNumber)
}

/// The eight warehouse tables written by the merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Address,
    Provider,
    ConnectivityType,
    Tariff,
    BonusDuration,
    Bonus,
    TariffBonusLink,
    Offer,
}

impl EntityKind {
    /// Declaration order; also the canonical merge order.
    pub const ALL: [EntityKind; 8] = [
        EntityKind::Address,
        EntityKind::Provider,
        EntityKind::ConnectivityType,
        EntityKind::Tariff,
        EntityKind::BonusDuration,
        EntityKind::Bonus,
        EntityKind::TariffBonusLink,
        EntityKind::Offer,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Address => "address",
            EntityKind::Provider => "provider",
            EntityKind::ConnectivityType => "connectivity_type",
            EntityKind::Tariff => "tariff",
            EntityKind::BonusDuration => "bonus_duration",
            EntityKind::Bonus => "bonus",
            EntityKind::TariffBonusLink => "tariff_bonus_link",
            EntityKind::Offer => "offer",
        }
    }

    pub fn table_name(self) -> &'static str {
        match self {
            EntityKind::Address => "addresses",
            EntityKind::Provider => "providers",
            EntityKind::ConnectivityType => "connectivity_types",
            EntityKind::Tariff => "tariffs",
            EntityKind::BonusDuration => "bonus_durations",
            EntityKind::Bonus => "bonuses",
            EntityKind::TariffBonusLink => "tariff_bonuses",
            EntityKind::Offer => "offers",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A candidate row that can be matched against existing rows by its natural key.
pub trait NaturalKey {
    type Key: Ord + Clone + fmt::Debug;
    const KIND: EntityKind;

    fn natural_key(&self) -> Self::Key;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AddressRow {
    pub street: String,
    pub city: String,
    pub zip: String,
}

impl NaturalKey for AddressRow {
    type Key = AddressRow;
    const KIND: EntityKind = EntityKind::Address;

    fn natural_key(&self) -> Self::Key {
        self.clone()
    }
}

/// Provider identity is the name alone; `provider_source` is carried but
/// never compared, so a known provider seen from a new source keeps its
/// first-recorded source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRow {
    pub provider_name: String,
    pub provider_source: String,
}

impl NaturalKey for ProviderRow {
    type Key = String;
    const KIND: EntityKind = EntityKind::Provider;

    fn natural_key(&self) -> Self::Key {
        self.provider_name.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityTypeRow {
    pub connectivity_name: String,
}

impl NaturalKey for ConnectivityTypeRow {
    type Key = String;
    const KIND: EntityKind = EntityKind::ConnectivityType;

    fn natural_key(&self) -> Self::Key {
        self.connectivity_name.clone()
    }
}

/// Numeric tariff attributes; all of them are part of the tariff natural key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct TariffTerms {
    pub nominal_price: Option<Amount>,
    pub discounted_price: Option<Amount>,
    pub contract_duration: Option<i32>,
    pub upload_rate: Option<Amount>,
    pub download_rate: Option<Amount>,
}

/// Tariff as observed in a document, referencing its provider and
/// connectivity type by name. The whole tuple is the natural key, so a
/// re-priced tariff is a new row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TariffCandidate {
    pub tariff_name: String,
    pub provider_name: String,
    pub connectivity_name: String,
    pub terms: TariffTerms,
}

impl NaturalKey for TariffCandidate {
    type Key = TariffCandidate;
    const KIND: EntityKind = EntityKind::Tariff;

    fn natural_key(&self) -> Self::Key {
        self.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BonusDurationRow {
    pub bonus_duration: i32,
}

impl NaturalKey for BonusDurationRow {
    type Key = i32;
    const KIND: EntityKind = EntityKind::BonusDuration;

    fn natural_key(&self) -> Self::Key {
        self.bonus_duration
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BonusKey {
    pub bonus_name: String,
    pub bonus_value: Option<Amount>,
}

/// A bonus entry that carries a duration. Entries without one never become
/// bonus rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BonusCandidate {
    pub bonus_name: String,
    pub bonus_value: Option<Amount>,
    pub bonus_duration: i32,
}

impl BonusCandidate {
    pub fn key(&self) -> BonusKey {
        BonusKey {
            bonus_name: self.bonus_name.clone(),
            bonus_value: self.bonus_value,
        }
    }
}

impl NaturalKey for BonusCandidate {
    type Key = BonusKey;
    const KIND: EntityKind = EntityKind::Bonus;

    fn natural_key(&self) -> Self::Key {
        self.key()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TariffBonusLinkCandidate {
    pub tariff: TariffCandidate,
    pub bonus: BonusKey,
}

impl NaturalKey for TariffBonusLinkCandidate {
    type Key = (TariffCandidate, BonusKey);
    const KIND: EntityKind = EntityKind::TariffBonusLink;

    fn natural_key(&self) -> Self::Key {
        (self.tariff.clone(), self.bonus.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferCandidate {
    pub address: AddressRow,
    pub tariff: TariffCandidate,
    pub date_collected: NaiveDate,
}

impl NaturalKey for OfferCandidate {
    type Key = (AddressRow, TariffCandidate, NaiveDate);
    const KIND: EntityKind = EntityKind::Offer;

    fn natural_key(&self) -> Self::Key {
        (
            self.address.clone(),
            self.tariff.clone(),
            self.date_collected,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TariffRecord {
    pub provider_id: SurrogateId,
    pub connectivity_id: SurrogateId,
    pub tariff_name: String,
    pub terms: TariffTerms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BonusRecord {
    pub bonus_name: String,
    pub bonus_value: Option<Amount>,
    pub bonus_duration_id: SurrogateId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TariffBonusLinkRecord {
    pub tariff_id: SurrogateId,
    pub bonus_id: SurrogateId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OfferRecord {
    pub address_id: SurrogateId,
    pub tariff_id: SurrogateId,
    pub date_collected: NaiveDate,
}

/// A row ready for insert-if-absent: every reference is a surrogate key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum MergeRecord {
    Address(AddressRow),
    Provider(ProviderRow),
    ConnectivityType(ConnectivityTypeRow),
    Tariff(TariffRecord),
    BonusDuration(BonusDurationRow),
    Bonus(BonusRecord),
    TariffBonusLink(TariffBonusLinkRecord),
    Offer(OfferRecord),
}

impl MergeRecord {
    pub fn kind(&self) -> EntityKind {
        match self {
            MergeRecord::Address(_) => EntityKind::Address,
            MergeRecord::Provider(_) => EntityKind::Provider,
            MergeRecord::ConnectivityType(_) => EntityKind::ConnectivityType,
            MergeRecord::Tariff(_) => EntityKind::Tariff,
            MergeRecord::BonusDuration(_) => EntityKind::BonusDuration,
            MergeRecord::Bonus(_) => EntityKind::Bonus,
            MergeRecord::TariffBonusLink(_) => EntityKind::TariffBonusLink,
            MergeRecord::Offer(_) => EntityKind::Offer,
        }
    }
}

/// Outcome of one insert-if-absent: the row's surrogate key and whether it was new.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub id: SurrogateId,
    pub inserted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_equality_ignores_zero_sign() {
        assert_eq!(Amount(0.0), Amount(-0.0));
        assert_ne!(Amount(30.0), Amount(30.000001));
        assert!(Amount(25.0) < Amount(30.0));
    }

    #[test]
    fn postal_code_accepts_numbers() {
        let address: DocumentAddress = serde_json::from_str(
            r#"{"street":"Gabelsbergerstr. 51","city":"München","postal_code":80333}"#,
        )
        .unwrap();
        assert_eq!(address.postal_code, "80333");
    }

    #[test]
    fn tariff_key_covers_every_term() {
        let base = TariffCandidate {
            tariff_name: "Basic".into(),
            provider_name: "Telekom".into(),
            connectivity_name: "dsl".into(),
            terms: TariffTerms {
                nominal_price: Some(Amount(30.0)),
                discounted_price: Some(Amount(25.0)),
                contract_duration: Some(24),
                upload_rate: Some(Amount(10.0)),
                download_rate: Some(Amount(100.0)),
            },
        };
        let mut repriced = base.clone();
        repriced.terms.nominal_price = Some(Amount(35.0));
        assert_ne!(base.natural_key(), repriced.natural_key());
    }

    #[test]
    fn provider_key_is_name_only() {
        let a = ProviderRow {
            provider_name: "Telekom".into(),
            provider_source: "www.telekom.de".into(),
        };
        let b = ProviderRow {
            provider_name: "Telekom".into(),
            provider_source: "www.check24.de".into(),
        };
        assert_eq!(a.natural_key(), b.natural_key());
    }

    #[test]
    fn document_defaults_empty_arrays() {
        let doc: TariffDocument = serde_json::from_str(
            r#"{"date":"2025-02-05","source":"www.telekom.de",
                "address":{"street":"a","city":"b","postal_code":"1"}}"#,
        )
        .unwrap();
        assert!(doc.tarifs.is_empty());
    }
}
