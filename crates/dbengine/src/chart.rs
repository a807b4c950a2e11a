//! Charts and dimensions as far as the storage core needs them.

use crate::error::{EngineError, Result};
use crate::page::MetricUuid;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier of a chart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChartId(Uuid);

impl ChartId {
    /// Generates a random chart id.
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    /// Builds a chart id from its raw bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl From<Uuid> for ChartId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for ChartId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// How collected values of a dimension are turned into stored values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum Algorithm {
    /// Store the collected value as is.
    #[default]
    Absolute,
    /// Store the difference from the previous collection.
    Incremental,
    /// Percentage of the row total of absolute values.
    PercentageOfAbsoluteRow,
    /// Percentage of the row total of incremental values.
    PercentageOfIncrementalRow,
}

impl Algorithm {
    /// Collector tag for the algorithm.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Absolute => "absolute",
            Algorithm::Incremental => "incremental",
            Algorithm::PercentageOfAbsoluteRow => "percentage-of-absolute-row",
            Algorithm::PercentageOfIncrementalRow => "percentage-of-incremental-row",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "absolute" => Ok(Algorithm::Absolute),
            "incremental" => Ok(Algorithm::Incremental),
            "percentage-of-absolute-row" => Ok(Algorithm::PercentageOfAbsoluteRow),
            "percentage-of-incremental-row" => Ok(Algorithm::PercentageOfIncrementalRow),
            other => Err(EngineError::InvalidDimension {
                id: String::new(),
                reason: format!("unknown algorithm '{other}'"),
            }),
        }
    }
}

/// A dimension: one metric series of a chart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dimension {
    /// Stable metric identifier.
    pub uuid: MetricUuid,
    /// Collector-facing id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Value multiplier.
    pub multiplier: i64,
    /// Value divisor, never zero.
    pub divisor: i64,
    /// Value algorithm.
    pub algorithm: Algorithm,
}

impl Dimension {
    /// Creates a dimension with a fresh UUID, multiplier and divisor of 1 and
    /// the absolute algorithm.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            uuid: MetricUuid::new_v4(),
            name: id.clone(),
            id,
            multiplier: 1,
            divisor: 1,
            algorithm: Algorithm::Absolute,
        }
    }

    /// Creates a dimension from all its fields.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidDimension` if `divisor` is zero.
    pub fn try_new(
        uuid: MetricUuid,
        id: impl Into<String>,
        name: impl Into<String>,
        multiplier: i64,
        divisor: i64,
        algorithm: Algorithm,
    ) -> Result<Self> {
        let id = id.into();
        if divisor == 0 {
            return Err(EngineError::InvalidDimension {
                id,
                reason: "divisor must not be zero".to_string(),
            });
        }
        Ok(Self {
            uuid,
            id,
            name: name.into(),
            multiplier,
            divisor,
            algorithm,
        })
    }

    /// Uses an existing UUID.
    pub fn with_uuid(mut self, uuid: MetricUuid) -> Self {
        self.uuid = uuid;
        self
    }

    /// Sets the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the algorithm.
    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Sets multiplier and divisor.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidDimension` if `divisor` is zero.
    pub fn with_scale(mut self, multiplier: i64, divisor: i64) -> Result<Self> {
        if divisor == 0 {
            return Err(EngineError::InvalidDimension {
                id: self.id,
                reason: "divisor must not be zero".to_string(),
            });
        }
        self.multiplier = multiplier;
        self.divisor = divisor;
        Ok(self)
    }
}

/// A chart and the dimensions it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chart {
    /// Chart identifier.
    pub id: ChartId,
    /// `type.id` string used by collectors.
    pub type_id: String,
    /// Display name.
    pub name: String,
    /// Collection interval in seconds.
    pub update_every: u32,
    /// Owned dimensions.
    pub dimensions: Vec<Dimension>,
}

impl Chart {
    /// Creates a chart with a fresh id, no dimensions and a one second
    /// interval.
    pub fn new(type_id: impl Into<String>) -> Self {
        let type_id = type_id.into();
        Self {
            id: ChartId::new_v4(),
            name: type_id.clone(),
            type_id,
            update_every: 1,
            dimensions: Vec::new(),
        }
    }

    /// Sets the collection interval.
    pub fn with_update_every(mut self, update_every: u32) -> Self {
        self.update_every = update_every.max(1);
        self
    }

    /// Adds a dimension.
    pub fn with_dimension(mut self, dimension: Dimension) -> Self {
        self.dimensions.push(dimension);
        self
    }

    /// Looks up a dimension by its collector id.
    pub fn dimension(&self, id: &str) -> Option<&Dimension> {
        self.dimensions.iter().find(|d| d.id == id)
    }

    /// UUIDs of all owned dimensions.
    pub fn dimension_uuids(&self) -> Vec<MetricUuid> {
        self.dimensions.iter().map(|d| d.uuid).collect()
    }
}
