//! Identifiers, timestamps and the injectable clock
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use uuid7::uuid7;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }
            /// Fresh time-ordered identifier
            pub fn generate() -> Self {
                Self(uuid7().to_string())
            }
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl<C> minicbor::Encode<C> for $name {
            fn encode<W: minicbor::encode::Write>(
                &self,
                e: &mut minicbor::Encoder<W>,
                _: &mut C,
            ) -> Result<(), minicbor::encode::Error<W::Error>> {
                e.str(&self.0)?.ok()
            }
        }

        impl<'b, C> minicbor::Decode<'b, C> for $name {
            fn decode(
                d: &mut minicbor::Decoder<'b>,
                _: &mut C,
            ) -> Result<Self, minicbor::decode::Error> {
                Ok(Self(d.str()?.to_owned()))
            }
        }
    };
}

string_id! {
    /// Identity of a coupon policy
    PolicyId
}
string_id! {
    /// Identity of the claiming user, validated upstream
    UserId
}
string_id! {
    /// Internal row identity of an issued coupon
    CouponId
}
string_id! {
    /// Human-facing coupon code, bech32m encoded
    CouponCode
}
string_id! {
    /// Identity of one issuance request; the idempotency key of the worker
    RequestId
}
string_id! {
    OrderId
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>)
where
    T::Offset: Copy;

// `Utc` itself is not ordered, so a derive would not apply
impl<T: TimeZone + Eq> PartialOrd for TimeStamp<T>
where
    T::Offset: Copy,
{
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: TimeZone + Eq> Ord for TimeStamp<T>
where
    T::Offset: Copy,
{
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Self {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .unwrap_or_default()
            .into()
    }
    pub fn from_millis(millis: i64) -> Self {
        Self(DateTime::from_timestamp_millis(millis).unwrap_or_default())
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    pub fn timestamp_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }
    pub fn plus(&self, duration: Duration) -> Self {
        Self(self.0 + duration)
    }
    pub fn minus(&self, duration: Duration) -> Self {
        Self(self.0 - duration)
    }
    /// Time left until `later`, zero when `later` has passed
    pub fn until(&self, later: &Self) -> Duration {
        (later.0 - self.0).max(Duration::zero())
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T>
where
    T::Offset: Copy,
{
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl std::fmt::Display for TimeStamp<Utc> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

/// Source of "now" for window checks, lazy expiry and counter TTLs.
pub trait Clock: Send + Sync {
    fn now(&self) -> TimeStamp<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> TimeStamp<Utc> {
        TimeStamp::new()
    }
}

/// Clock that only moves when told to. Used to pin window boundaries in tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<TimeStamp<Utc>>,
}

impl ManualClock {
    pub fn new(start: TimeStamp<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }
    pub fn set(&self, at: TimeStamp<Utc>) {
        *self.now.lock() = at;
    }
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = now.plus(by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> TimeStamp<Utc> {
        *self.now.lock()
    }
}
