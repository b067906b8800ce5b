//! Unsigned time management
#![warn(missing_docs)]
#![warn(unused_crate_dependencies)]

mod error;
pub use error::TimeError;
use dbft_serialization::{Deserializer, Serializer, U64VarIntDeserializer, U64VarIntSerializer};
use nom::error::{context, ContextError, ParseError};
use nom::IResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Bound;
use std::str::FromStr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Time structure used everywhere.
/// milliseconds since 01/01/1970.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DbftTime(u64);

/// Serializer for `DbftTime`
#[derive(Clone)]
pub struct DbftTimeSerializer {
    u64_serializer: U64VarIntSerializer,
}

impl DbftTimeSerializer {
    /// Creates a `DbftTimeSerializer`
    pub fn new() -> Self {
        Self {
            u64_serializer: U64VarIntSerializer::new(),
        }
    }
}

impl Default for DbftTimeSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Serializer<DbftTime> for DbftTimeSerializer {
    /// ```
    /// use dbft_serialization::Serializer;
    /// use dbft_time::{DbftTime, DbftTimeSerializer};
    ///
    /// let time: DbftTime = DbftTime::from_millis(30);
    /// let mut serialized = Vec::new();
    /// let serializer = DbftTimeSerializer::new();
    /// serializer.serialize(&time, &mut serialized).unwrap();
    /// ```
    fn serialize(
        &self,
        value: &DbftTime,
        buffer: &mut Vec<u8>,
    ) -> Result<(), dbft_serialization::SerializeError> {
        self.u64_serializer.serialize(&value.to_millis(), buffer)
    }
}

fn map_bound(bound: Bound<DbftTime>) -> Bound<u64> {
    match bound {
        Bound::Included(t) => Bound::Included(t.to_millis()),
        Bound::Excluded(t) => Bound::Excluded(t.to_millis()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// Deserializer for `DbftTime`
#[derive(Clone)]
pub struct DbftTimeDeserializer {
    u64_deserializer: U64VarIntDeserializer,
}

impl DbftTimeDeserializer {
    /// Creates a `DbftTimeDeserializer`
    ///
    /// Arguments:
    /// * range: bounds for the time to deserialize
    pub fn new(range: (Bound<DbftTime>, Bound<DbftTime>)) -> Self {
        Self {
            u64_deserializer: U64VarIntDeserializer::new(map_bound(range.0), map_bound(range.1)),
        }
    }
}

impl Deserializer<DbftTime> for DbftTimeDeserializer {
    /// ```
    /// use std::ops::Bound::Included;
    /// use dbft_serialization::{Serializer, Deserializer, DeserializeError};
    /// use dbft_time::{DbftTime, DbftTimeSerializer, DbftTimeDeserializer};
    ///
    /// let time: DbftTime = DbftTime::from_millis(30);
    /// let mut serialized = Vec::new();
    /// let serializer = DbftTimeSerializer::new();
    /// let deserializer = DbftTimeDeserializer::new((Included(DbftTime::from_millis(0)), Included(DbftTime::from_millis(u64::MAX))));
    /// serializer.serialize(&time, &mut serialized).unwrap();
    /// let (rest, time_deser) = deserializer.deserialize::<DeserializeError>(&serialized).unwrap();
    /// assert!(rest.is_empty());
    /// assert_eq!(time, time_deser);
    /// ```
    fn deserialize<'a, E: ParseError<&'a [u8]> + ContextError<&'a [u8]>>(
        &self,
        buffer: &'a [u8],
    ) -> IResult<&'a [u8], DbftTime, E> {
        context("Failed DbftTime deserialization", |input| {
            self.u64_deserializer
                .deserialize(input)
                .map(|(rest, res)| (rest, DbftTime::from_millis(res)))
        })(buffer)
    }
}

impl fmt::Display for DbftTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_millis())
    }
}

impl TryFrom<Duration> for DbftTime {
    type Error = TimeError;

    fn try_from(value: Duration) -> Result<Self, Self::Error> {
        Ok(DbftTime(
            value
                .as_millis()
                .try_into()
                .map_err(|_| TimeError::ConversionError)?,
        ))
    }
}

impl From<DbftTime> for Duration {
    fn from(value: DbftTime) -> Self {
        value.to_duration()
    }
}

impl FromStr for DbftTime {
    type Err = crate::TimeError;

    /// ```
    /// # use dbft_time::*;
    /// # use std::str::FromStr;
    /// let duration: &str = "42";
    /// let time : DbftTime = DbftTime::from_millis(42);
    ///
    /// assert_eq!(time, DbftTime::from_str(duration).unwrap());
    /// ```
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(DbftTime(
            u64::from_str(s).map_err(|_| Self::Err::ConversionError)?,
        ))
    }
}

impl DbftTime {
    /// Conversion from `u64`, representing timestamp in milliseconds.
    /// ```
    /// # use dbft_time::*;
    /// let time : DbftTime = DbftTime::from_millis(42);
    /// ```
    pub const fn from_millis(value: u64) -> Self {
        DbftTime(value)
    }

    /// Smallest time interval
    pub const EPSILON: DbftTime = DbftTime(1);

    /// Gets current UNIX timestamp (resolution: milliseconds).
    pub fn now() -> Result<Self, TimeError> {
        let now: u64 = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| TimeError::TimeOverflowError)?
            .as_millis()
            .try_into()
            .map_err(|_| TimeError::TimeOverflowError)?;
        Ok(DbftTime(now))
    }

    /// Conversion to `std::time::Duration`.
    pub fn to_duration(&self) -> Duration {
        Duration::from_millis(self.0)
    }

    /// Conversion to `u64`, representing milliseconds.
    /// ```
    /// # use dbft_time::*;
    /// let time : DbftTime = DbftTime::from_millis(42);
    /// let res: u64 = time.to_millis();
    /// assert_eq!(res, 42);
    /// ```
    pub const fn to_millis(&self) -> u64 {
        self.0
    }

    /// Estimate the `Instant` at which this timestamp occurs relative to the system clock.
    pub fn estimate_instant(self) -> Result<Instant, TimeError> {
        let (cur_timestamp, cur_instant) = (DbftTime::now()?, Instant::now());
        if self >= cur_timestamp {
            cur_instant.checked_add(self.saturating_sub(cur_timestamp).to_duration())
        } else {
            cur_instant.checked_sub(cur_timestamp.saturating_sub(self).to_duration())
        }
        .ok_or(TimeError::TimeOverflowError)
    }

    /// ```
    /// # use dbft_time::*;
    /// let time_1 : DbftTime = DbftTime::from_millis(42);
    /// let time_2 : DbftTime = DbftTime::from_millis(7);
    /// let res : DbftTime = time_1.saturating_sub(time_2);
    /// assert_eq!(res, DbftTime::from_millis(42-7))
    /// ```
    #[must_use]
    pub fn saturating_sub(self, t: DbftTime) -> Self {
        DbftTime(self.0.saturating_sub(t.0))
    }

    /// ```
    /// # use dbft_time::*;
    /// let time_1 : DbftTime = DbftTime::from_millis(42);
    /// let time_2 : DbftTime = DbftTime::from_millis(7);
    /// let res : DbftTime = time_1.saturating_add(time_2);
    /// assert_eq!(res, DbftTime::from_millis(42+7))
    /// ```
    #[must_use]
    pub fn saturating_add(self, t: DbftTime) -> Self {
        DbftTime(self.0.saturating_add(t.0))
    }

    /// Checked subtraction.
    pub fn checked_sub(self, t: DbftTime) -> Result<Self, TimeError> {
        self.0
            .checked_sub(t.0)
            .ok_or_else(|| TimeError::CheckedOperationError("subtraction error".to_string()))
            .map(DbftTime)
    }

    /// Checked addition.
    pub fn checked_add(self, t: DbftTime) -> Result<Self, TimeError> {
        self.0
            .checked_add(t.0)
            .ok_or_else(|| TimeError::CheckedOperationError("addition error".to_string()))
            .map(DbftTime)
    }

    /// Checked division by a scalar.
    pub fn checked_div_u64(self, n: u64) -> Result<DbftTime, TimeError> {
        self.0
            .checked_div(n)
            .ok_or_else(|| TimeError::CheckedOperationError("division error".to_string()))
            .map(DbftTime)
    }

    /// ```
    /// # use dbft_time::*;
    /// let time_1 : DbftTime = DbftTime::from_millis(42);
    /// let res : DbftTime = time_1.saturating_mul(7);
    /// assert_eq!(res,DbftTime::from_millis(42*7))
    /// ```
    #[must_use]
    pub const fn saturating_mul(self, n: u64) -> DbftTime {
        DbftTime(self.0.saturating_mul(n))
    }

    /// Checked multiplication by a scalar.
    pub fn checked_mul(self, n: u64) -> Result<Self, TimeError> {
        self.0
            .checked_mul(n)
            .ok_or_else(|| TimeError::CheckedOperationError("multiplication error".to_string()))
            .map(DbftTime)
    }

    /// ```
    /// # use dbft_time::*;
    ///
    /// let time1 = DbftTime::from_millis(42);
    /// let time2 = DbftTime::from_millis(84);
    ///
    /// assert_eq!(time1.abs_diff(time2), DbftTime::from_millis(42));
    /// assert_eq!(time2.abs_diff(time1), DbftTime::from_millis(42));
    /// ```
    pub fn abs_diff(&self, t: DbftTime) -> DbftTime {
        DbftTime(self.0.abs_diff(t.0))
    }

    /// Get max DbftTime value
    pub fn max() -> DbftTime {
        DbftTime::from_millis(u64::MAX)
    }
}

/// Source of the current timestamp.
///
/// The consensus worker reads time through this trait so that tests can drive
/// timer logic with a controlled clock instead of the system clock.
pub trait Clock: Send + Sync {
    /// Current UNIX timestamp (resolution: milliseconds).
    fn now(&self) -> DbftTime;
}

/// `Clock` implementation backed by the system clock.
#[derive(Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DbftTime {
        // clock before UNIX_EPOCH or after year 584M, treat as epoch
        DbftTime::now().unwrap_or(DbftTime::from_millis(0))
    }
}
