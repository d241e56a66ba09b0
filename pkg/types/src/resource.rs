use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

// --- Well-known resource names ---

pub const CPU: &str = "cpu";
pub const MEMORY: &str = "memory";
pub const STORAGE: &str = "storage";
pub const EPHEMERAL_STORAGE: &str = "ephemeral-storage";
pub const PODS: &str = "pods";
pub const SERVICES: &str = "services";
pub const SERVICES_LOAD_BALANCERS: &str = "services.loadbalancers";
pub const SERVICES_NODE_PORTS: &str = "services.nodeports";
pub const PERSISTENT_VOLUME_CLAIMS: &str = "persistentvolumeclaims";

pub const REQUESTS_CPU: &str = "requests.cpu";
pub const REQUESTS_MEMORY: &str = "requests.memory";
pub const REQUESTS_STORAGE: &str = "requests.storage";
pub const REQUESTS_EPHEMERAL_STORAGE: &str = "requests.ephemeral-storage";
pub const LIMITS_CPU: &str = "limits.cpu";
pub const LIMITS_MEMORY: &str = "limits.memory";
pub const LIMITS_EPHEMERAL_STORAGE: &str = "limits.ephemeral-storage";

/// Accelerator resource tracked natively by the pod evaluator.
pub const GPU: &str = "nvidia.com/gpu";
pub const REQUESTS_GPU: &str = "requests.nvidia.com/gpu";

/// Family prefix for sub-partitioned memory classes (e.g. `hugepages-2Mi`).
pub const HUGEPAGES_PREFIX: &str = "hugepages-";
pub const REQUESTS_HUGEPAGES_PREFIX: &str = "requests.hugepages-";

/// Prefix under which extended resources are quota'd.
pub const DEFAULT_REQUESTS_PREFIX: &str = "requests.";

/// Names under this domain are native even though they carry a `/`.
pub const NATIVE_RESOURCE_DOMAIN: &str = "kubernetes.io/";

/// Object-count resource name for a resource kind, e.g. `count/pods`.
pub fn object_count_name(resource: &str) -> String {
    format!("count/{}", resource)
}

/// A native resource either has no domain or lives under `kubernetes.io/`.
pub fn is_native_resource(name: &str) -> bool {
    !name.contains('/') || name.contains(NATIVE_RESOURCE_DOMAIN)
}

/// Extended (opaque) resources are domain-qualified, non-native names that
/// remain valid qualified names once prefixed with `requests.`.
pub fn is_extended_resource_name(name: &str) -> bool {
    if is_native_resource(name) || name.starts_with(DEFAULT_REQUESTS_PREFIX) {
        return false;
    }
    crate::validate::is_qualified_name(&format!("{}{}", DEFAULT_REQUESTS_PREFIX, name))
}

// --- Quantity ---

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuantityError {
    #[error("quantity must not be empty")]
    Empty,
    #[error("quantity '{0}' must not be negative")]
    Negative(String),
    #[error("quantity '{0}' is not a valid number")]
    Invalid(String),
    #[error("quantity '{0}' has unknown suffix '{1}'")]
    UnknownSuffix(String, String),
    #[error("quantity '{0}' is too large")]
    TooLarge(String),
}

/// A non-negative resource amount stored at milli-unit precision.
///
/// Parsed from Kubernetes-style strings (`500m`, `2`, `1.5`, `128Mi`, `1G`,
/// `1e3`). Fractions finer than a milli-unit round up. All arithmetic saturates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Quantity {
    milli: u64,
}

impl Quantity {
    pub const ZERO: Quantity = Quantity { milli: 0 };

    pub fn from_units(units: u64) -> Self {
        Self {
            milli: units.saturating_mul(1000),
        }
    }

    pub fn from_milli(milli: u64) -> Self {
        Self { milli }
    }

    pub fn milli_value(&self) -> u64 {
        self.milli
    }

    /// Whole units, rounded up.
    pub fn value(&self) -> u64 {
        self.milli.div_ceil(1000)
    }

    pub fn is_zero(&self) -> bool {
        self.milli == 0
    }

    pub fn saturating_add(self, other: Quantity) -> Quantity {
        Quantity {
            milli: self.milli.saturating_add(other.milli),
        }
    }

    /// Subtraction clamped at zero.
    pub fn saturating_sub(self, other: Quantity) -> Quantity {
        Quantity {
            milli: self.milli.saturating_sub(other.milli),
        }
    }

    pub fn parse(input: &str) -> Result<Self, QuantityError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(QuantityError::Empty);
        }
        if trimmed.starts_with('-') {
            return Err(QuantityError::Negative(input.to_string()));
        }
        let s = trimmed.strip_prefix('+').unwrap_or(trimmed);

        let number_end = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());
        let (number, suffix) = s.split_at(number_end);

        let (int_part, frac_part) = number.split_once('.').unwrap_or((number, ""));
        if frac_part.contains('.') || (int_part.is_empty() && frac_part.is_empty()) {
            return Err(QuantityError::Invalid(input.to_string()));
        }
        let mantissa: u128 = format!("{}{}", int_part, frac_part)
            .parse()
            .map_err(|_| QuantityError::Invalid(input.to_string()))?;

        let (num, den) = suffix_multiplier(suffix)
            .ok_or_else(|| QuantityError::UnknownSuffix(input.to_string(), suffix.to_string()))?;

        let too_large = || QuantityError::TooLarge(input.to_string());
        let frac_scale = 10u128
            .checked_pow(frac_part.len() as u32)
            .ok_or_else(too_large)?;
        let den = den.checked_mul(frac_scale).ok_or_else(too_large)?;
        let numerator = mantissa
            .checked_mul(num)
            .and_then(|v| v.checked_mul(1000))
            .ok_or_else(too_large)?;
        let milli = u64::try_from(numerator.div_ceil(den)).map_err(|_| too_large())?;
        Ok(Self { milli })
    }
}

/// Returns the `(numerator, denominator)` a suffix scales by.
fn suffix_multiplier(suffix: &str) -> Option<(u128, u128)> {
    let pow10 = |exp: u32| 10u128.checked_pow(exp);
    let m = match suffix {
        "" => (1, 1),
        "m" => (1, 1000),
        "k" => (pow10(3)?, 1),
        "M" => (pow10(6)?, 1),
        "G" => (pow10(9)?, 1),
        "T" => (pow10(12)?, 1),
        "P" => (pow10(15)?, 1),
        "E" => (pow10(18)?, 1),
        "Ki" => (1 << 10, 1),
        "Mi" => (1 << 20, 1),
        "Gi" => (1 << 30, 1),
        "Ti" => (1 << 40, 1),
        "Pi" => (1 << 50, 1),
        "Ei" => (1 << 60, 1),
        other => {
            let exp = other
                .strip_prefix('e')
                .or_else(|| other.strip_prefix('E'))?;
            let exp: i32 = exp.parse().ok()?;
            if exp.unsigned_abs() > 30 {
                return None;
            }
            if exp >= 0 {
                (pow10(exp as u32)?, 1)
            } else {
                (1, pow10(exp.unsigned_abs())?)
            }
        }
    };
    Some(m)
}

impl FromStr for Quantity {
    type Err = QuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Quantity::parse(s)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.milli % 1000 == 0 {
            write!(f, "{}", self.milli / 1000)
        } else {
            write!(f, "{}m", self.milli)
        }
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(u64),
            Float(f64),
            Str(String),
        }

        let parsed = match Raw::deserialize(deserializer)? {
            Raw::Int(n) => Ok(Quantity::from_units(n)),
            Raw::Float(n) => Quantity::parse(&n.to_string()),
            Raw::Str(s) => Quantity::parse(&s),
        };
        parsed.map_err(serde::de::Error::custom)
    }
}

// --- ResourceList ---

/// Resource name → quantity, ordered by name so serialization is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceList(BTreeMap<String, Quantity>);

impl ResourceList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Quantity> {
        self.0.get(name).copied()
    }

    pub fn insert(&mut self, name: impl Into<String>, quantity: Quantity) {
        self.0.insert(name.into(), quantity);
    }

    pub fn remove(&mut self, name: &str) -> Option<Quantity> {
        self.0.remove(name)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Quantity)> {
        self.0.iter()
    }

    /// Resource names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    /// Key-wise sum over the union of both key sets.
    pub fn add(&self, other: &ResourceList) -> ResourceList {
        let mut result = self.clone();
        for (name, quantity) in &other.0 {
            let entry = result.0.entry(name.clone()).or_default();
            *entry = entry.saturating_add(*quantity);
        }
        result
    }

    /// Key-wise difference, clamped at zero. Keys only present in `other`
    /// do not appear in the result.
    pub fn subtract(&self, other: &ResourceList) -> ResourceList {
        let mut result = self.clone();
        for (name, quantity) in result.0.iter_mut() {
            if let Some(sub) = other.0.get(name) {
                *quantity = quantity.saturating_sub(*sub);
            }
        }
        result
    }

    /// Key-wise maximum over the union of both key sets.
    pub fn max(&self, other: &ResourceList) -> ResourceList {
        let mut result = self.clone();
        for (name, quantity) in &other.0 {
            let entry = result.0.entry(name.clone()).or_default();
            if *quantity > *entry {
                *entry = *quantity;
            }
        }
        result
    }

    /// Only the entries whose names are in `names`.
    pub fn mask<S: AsRef<str>>(&self, names: &[S]) -> ResourceList {
        let keep: BTreeSet<&str> = names.iter().map(|n| n.as_ref()).collect();
        ResourceList(
            self.0
                .iter()
                .filter(|(name, _)| keep.contains(name.as_str()))
                .map(|(name, q)| (name.clone(), *q))
                .collect(),
        )
    }

    pub fn remove_zeros(&self) -> ResourceList {
        ResourceList(
            self.0
                .iter()
                .filter(|(_, q)| !q.is_zero())
                .map(|(name, q)| (name.clone(), *q))
                .collect(),
        )
    }

    pub fn is_zero(&self) -> bool {
        self.0.values().all(Quantity::is_zero)
    }

    /// Checks every entry against the same-named limit. Entries without a
    /// limit always pass. Returns the names that exceed their limit.
    pub fn less_than_or_equal(&self, limits: &ResourceList) -> (bool, Vec<String>) {
        let exceeded: Vec<String> = self
            .0
            .iter()
            .filter(|(name, q)| limits.get(name).is_some_and(|limit| **q > limit))
            .map(|(name, _)| name.clone())
            .collect();
        (exceeded.is_empty(), exceeded)
    }
}

impl FromIterator<(String, Quantity)> for ResourceList {
    fn from_iter<I: IntoIterator<Item = (String, Quantity)>>(iter: I) -> Self {
        ResourceList(iter.into_iter().collect())
    }
}

impl<'a> FromIterator<(&'a str, Quantity)> for ResourceList {
    fn from_iter<I: IntoIterator<Item = (&'a str, Quantity)>>(iter: I) -> Self {
        ResourceList(iter.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }
}

/// Renders as `name=quantity` pairs joined by commas.
impl fmt::Display for ResourceList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, quantity) in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{}={}", name, quantity)?;
            first = false;
        }
        Ok(())
    }
}

/// Names present in both lists, in `a`'s order, without duplicates.
pub fn intersection<A: AsRef<str>, B: AsRef<str>>(a: &[A], b: &[B]) -> Vec<String> {
    let other: BTreeSet<&str> = b.iter().map(|n| n.as_ref()).collect();
    let mut seen = BTreeSet::new();
    a.iter()
        .map(|n| n.as_ref())
        .filter(|n| other.contains(n) && seen.insert(*n))
        .map(str::to_string)
        .collect()
}

pub fn to_set<S: AsRef<str>>(names: &[S]) -> BTreeSet<String> {
    names.iter().map(|n| n.as_ref().to_string()).collect()
}

pub fn contains_prefix(prefixes: &[&str], name: &str) -> bool {
    prefixes.iter().any(|p| name.starts_with(p))
}
