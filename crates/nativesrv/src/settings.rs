//! Query and session level settings.
//!
//! Values travel as strings on the wire. Every setting knows how to parse and
//! format itself, and which settings were explicitly changed is tracked so
//! they can be forwarded.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use tracing::warn;

use crate::compression::CompressionMethod;
use crate::errors::{NativeSrvError, Result};
use crate::messages::{SETTING_FLAG_CUSTOM, SettingChange};

/// Minimum level of server log messages forwarded to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogsLevel {
    #[default]
    None,
    Fatal,
    Error,
    Warning,
    Information,
    Debug,
    Trace,
    Test,
}

impl LogsLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Fatal => "fatal",
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Information => "information",
            Self::Debug => "debug",
            Self::Trace => "trace",
            Self::Test => "test",
        }
    }

    /// Most verbose tracing level that passes this filter.
    pub fn max_tracing_level(&self) -> Option<tracing::Level> {
        match self {
            Self::None => None,
            Self::Fatal | Self::Error => Some(tracing::Level::ERROR),
            Self::Warning => Some(tracing::Level::WARN),
            Self::Information => Some(tracing::Level::INFO),
            Self::Debug => Some(tracing::Level::DEBUG),
            Self::Trace | Self::Test => Some(tracing::Level::TRACE),
        }
    }
}

impl FromStr for LogsLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "none" | "" => Self::None,
            "fatal" => Self::Fatal,
            "error" => Self::Error,
            "warning" => Self::Warning,
            "information" => Self::Information,
            "debug" => Self::Debug,
            "trace" => Self::Trace,
            "test" => Self::Test,
            _ => return Err(()),
        })
    }
}

impl fmt::Display for LogsLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub async_insert: bool,
    pub wait_for_async_insert: bool,
    pub wait_for_async_insert_timeout: Duration,
    /// How often progress is sent and cancellation is checked while a query
    /// runs.
    pub interactive_delay: Duration,
    pub send_timeout: Duration,
    pub receive_timeout: Duration,
    /// How long to wait for a query before checking whether to stop.
    pub poll_interval: Duration,
    pub idle_connection_timeout: Duration,
    pub send_logs_level: LogsLevel,
    pub send_profile_events: bool,
    pub partial_result_on_first_cancel: bool,
    pub calculate_text_stack_trace: bool,
    pub session_timezone: String,
    pub extremes: bool,
    pub max_block_size: u64,
    pub network_compression_method: CompressionMethod,
    pub async_insert_busy_timeout: Duration,
    pub async_insert_max_data_size: u64,
    /// User defined settings, kept verbatim.
    pub custom: BTreeMap<String, String>,
    changed: BTreeSet<&'static str>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            async_insert: false,
            wait_for_async_insert: true,
            wait_for_async_insert_timeout: Duration::from_secs(120),
            interactive_delay: Duration::from_micros(100_000),
            send_timeout: Duration::from_secs(300),
            receive_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(10),
            idle_connection_timeout: Duration::from_secs(3600),
            send_logs_level: LogsLevel::None,
            send_profile_events: true,
            partial_result_on_first_cancel: false,
            calculate_text_stack_trace: true,
            session_timezone: String::new(),
            extremes: false,
            max_block_size: 65409,
            network_compression_method: CompressionMethod::Lz4,
            async_insert_busy_timeout: Duration::from_millis(200),
            async_insert_max_data_size: 10 * 1024 * 1024,
            custom: BTreeMap::new(),
            changed: BTreeSet::new(),
        }
    }
}

impl Settings {
    /// Set a setting from its string value.
    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        let func = GET_SET_FUNCTIONS
            .get(name)
            .ok_or_else(|| NativeSrvError::UnknownSetting(name.to_string()))?;
        (func.set)(value, self).map_err(|_| NativeSrvError::InvalidSettingValue {
            name: name.to_string(),
            value: value.to_string(),
        })?;
        self.changed.insert(func.name);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<String> {
        let func = GET_SET_FUNCTIONS
            .get(name)
            .ok_or_else(|| NativeSrvError::UnknownSetting(name.to_string()))?;
        Ok((func.get)(self))
    }

    pub fn is_known(name: &str) -> bool {
        GET_SET_FUNCTIONS.contains_key(name)
    }

    pub fn description(name: &str) -> Option<&'static str> {
        GET_SET_FUNCTIONS.get(name).map(|f| f.description)
    }

    pub fn is_changed(&self, name: &str) -> bool {
        self.changed.contains(name)
    }

    /// Apply changes sent by a client.
    ///
    /// Unknown settings fail the whole batch if marked important, and are
    /// otherwise skipped. Nothing is applied if any change fails.
    pub fn apply_changes(&mut self, changes: &[SettingChange]) -> Result<()> {
        let mut next = self.clone();
        for change in changes {
            if change.flags & SETTING_FLAG_CUSTOM != 0 {
                next.custom.insert(change.name.clone(), change.value.clone());
                continue;
            }
            match next.set(&change.name, &change.value) {
                Ok(()) => (),
                Err(NativeSrvError::UnknownSetting(name)) if !change.is_important() => {
                    warn!(%name, "ignoring unknown setting");
                }
                Err(e) => return Err(e),
            }
        }
        *self = next;
        Ok(())
    }

    /// Settings that differ from the defaults because they were set.
    pub fn changes(&self) -> Vec<SettingChange> {
        let mut changes: Vec<_> = self
            .changed
            .iter()
            .filter_map(|name| {
                let value = self.get(name).ok()?;
                Some(SettingChange::new(*name, value))
            })
            .collect();
        changes.extend(self.custom.iter().map(|(name, value)| SettingChange {
            name: name.clone(),
            flags: SETTING_FLAG_CUSTOM,
            value: value.clone(),
        }));
        changes
    }
}

struct SettingFunctions {
    name: &'static str,
    description: &'static str,
    set: fn(value: &str, settings: &mut Settings) -> Result<(), ()>,
    get: fn(settings: &Settings) -> String,
}

impl SettingFunctions {
    const fn new<S: SessionSetting>() -> Self {
        SettingFunctions {
            name: S::NAME,
            description: S::DESCRIPTION,
            set: S::set_from_str as _,
            get: S::get_as_string as _,
        }
    }
}

fn insert_setting<S: SessionSetting>(map: &mut HashMap<&'static str, SettingFunctions>) {
    if map.insert(S::NAME, SettingFunctions::new::<S>()).is_some() {
        panic!("Duplicate settings names: {}", S::NAME);
    }
}

static GET_SET_FUNCTIONS: LazyLock<HashMap<&'static str, SettingFunctions>> = LazyLock::new(|| {
    let mut map = HashMap::new();

    insert_setting::<AsyncInsert>(&mut map);
    insert_setting::<WaitForAsyncInsert>(&mut map);
    insert_setting::<WaitForAsyncInsertTimeout>(&mut map);
    insert_setting::<InteractiveDelay>(&mut map);
    insert_setting::<SendTimeout>(&mut map);
    insert_setting::<ReceiveTimeout>(&mut map);
    insert_setting::<PollInterval>(&mut map);
    insert_setting::<IdleConnectionTimeout>(&mut map);
    insert_setting::<SendLogsLevel>(&mut map);
    insert_setting::<SendProfileEvents>(&mut map);
    insert_setting::<PartialResultOnFirstCancel>(&mut map);
    insert_setting::<CalculateTextStackTrace>(&mut map);
    insert_setting::<SessionTimezone>(&mut map);
    insert_setting::<Extremes>(&mut map);
    insert_setting::<MaxBlockSize>(&mut map);
    insert_setting::<NetworkCompressionMethod>(&mut map);
    insert_setting::<AsyncInsertBusyTimeout>(&mut map);
    insert_setting::<AsyncInsertMaxDataSize>(&mut map);

    map
});

pub trait SessionSetting: Sync + Send + 'static {
    const NAME: &'static str;
    const DESCRIPTION: &'static str;

    fn set_from_str(value: &str, settings: &mut Settings) -> Result<(), ()>;
    fn get_as_string(settings: &Settings) -> String;
}

fn parse_bool(s: &str) -> Result<bool, ()> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(()),
    }
}

fn format_bool(b: bool) -> String {
    if b { "1" } else { "0" }.to_string()
}

fn parse_u64(s: &str) -> Result<u64, ()> {
    s.parse().map_err(|_| ())
}

/// Parse a possibly fractional number of `unit`s.
fn parse_duration(s: &str, unit: Duration) -> Result<Duration, ()> {
    let v: f64 = s.parse().map_err(|_| ())?;
    if !v.is_finite() || v < 0.0 {
        return Err(());
    }
    Ok(unit.mul_f64(v))
}

macro_rules! bool_setting {
    ($ty:ident, $name:literal, $field:ident, $desc:literal) => {
        pub struct $ty;

        impl SessionSetting for $ty {
            const NAME: &'static str = $name;
            const DESCRIPTION: &'static str = $desc;

            fn set_from_str(value: &str, settings: &mut Settings) -> Result<(), ()> {
                settings.$field = parse_bool(value)?;
                Ok(())
            }

            fn get_as_string(settings: &Settings) -> String {
                format_bool(settings.$field)
            }
        }
    };
}

macro_rules! duration_setting {
    ($ty:ident, $name:literal, $field:ident, $unit:expr, $as_unit:ident, $desc:literal) => {
        pub struct $ty;

        impl SessionSetting for $ty {
            const NAME: &'static str = $name;
            const DESCRIPTION: &'static str = $desc;

            fn set_from_str(value: &str, settings: &mut Settings) -> Result<(), ()> {
                settings.$field = parse_duration(value, $unit)?;
                Ok(())
            }

            fn get_as_string(settings: &Settings) -> String {
                settings.$field.$as_unit().to_string()
            }
        }
    };
}

bool_setting!(AsyncInsert, "async_insert", async_insert, "Buffer inserts on the server");
bool_setting!(
    WaitForAsyncInsert,
    "wait_for_async_insert",
    wait_for_async_insert,
    "Wait until a buffered insert has been flushed"
);
bool_setting!(
    SendProfileEvents,
    "send_profile_events",
    send_profile_events,
    "Send profile event packets to the client"
);
bool_setting!(
    PartialResultOnFirstCancel,
    "partial_result_on_first_cancel",
    partial_result_on_first_cancel,
    "Return rows read so far on the first cancel instead of stopping"
);
bool_setting!(
    CalculateTextStackTrace,
    "calculate_text_stack_trace",
    calculate_text_stack_trace,
    "Include stack traces in exceptions sent to the client"
);
bool_setting!(Extremes, "extremes", extremes, "Compute minimum and maximum values of the result");

duration_setting!(
    WaitForAsyncInsertTimeout,
    "wait_for_async_insert_timeout",
    wait_for_async_insert_timeout,
    Duration::from_secs(1),
    as_secs,
    "Seconds to wait for a buffered insert to be flushed"
);
duration_setting!(
    InteractiveDelay,
    "interactive_delay",
    interactive_delay,
    Duration::from_micros(1),
    as_micros,
    "Microseconds between progress packets and cancellation checks"
);
duration_setting!(
    SendTimeout,
    "send_timeout",
    send_timeout,
    Duration::from_secs(1),
    as_secs,
    "Seconds to wait for a write to the client"
);
duration_setting!(
    ReceiveTimeout,
    "receive_timeout",
    receive_timeout,
    Duration::from_secs(1),
    as_secs,
    "Seconds to wait for a packet from the client"
);
duration_setting!(
    PollInterval,
    "poll_interval",
    poll_interval,
    Duration::from_secs(1),
    as_secs,
    "Seconds to block waiting for a query before checking for shutdown"
);
duration_setting!(
    IdleConnectionTimeout,
    "idle_connection_timeout",
    idle_connection_timeout,
    Duration::from_secs(1),
    as_secs,
    "Seconds an idle connection is kept open"
);
duration_setting!(
    AsyncInsertBusyTimeout,
    "async_insert_busy_timeout_ms",
    async_insert_busy_timeout,
    Duration::from_millis(1),
    as_millis,
    "Milliseconds buffered inserts are held before a flush"
);

pub struct SendLogsLevel;

impl SessionSetting for SendLogsLevel {
    const NAME: &'static str = "send_logs_level";
    const DESCRIPTION: &'static str = "Send server logs of this level and above to the client";

    fn set_from_str(value: &str, settings: &mut Settings) -> Result<(), ()> {
        settings.send_logs_level = value.parse()?;
        Ok(())
    }

    fn get_as_string(settings: &Settings) -> String {
        settings.send_logs_level.to_string()
    }
}

pub struct SessionTimezone;

impl SessionSetting for SessionTimezone {
    const NAME: &'static str = "session_timezone";
    const DESCRIPTION: &'static str = "Timezone for the session, empty for the server's";

    fn set_from_str(value: &str, settings: &mut Settings) -> Result<(), ()> {
        settings.session_timezone = value.to_string();
        Ok(())
    }

    fn get_as_string(settings: &Settings) -> String {
        settings.session_timezone.clone()
    }
}

pub const MIN_BLOCK_SIZE: u64 = 1;

pub struct MaxBlockSize;

impl SessionSetting for MaxBlockSize {
    const NAME: &'static str = "max_block_size";
    const DESCRIPTION: &'static str = "Maximum number of rows in a result block";

    fn set_from_str(value: &str, settings: &mut Settings) -> Result<(), ()> {
        let val = parse_u64(value)?;
        if val < MIN_BLOCK_SIZE {
            return Err(());
        }
        settings.max_block_size = val;
        Ok(())
    }

    fn get_as_string(settings: &Settings) -> String {
        settings.max_block_size.to_string()
    }
}

pub struct AsyncInsertMaxDataSize;

impl SessionSetting for AsyncInsertMaxDataSize {
    const NAME: &'static str = "async_insert_max_data_size";
    const DESCRIPTION: &'static str = "Bytes buffered per insert before a flush";

    fn set_from_str(value: &str, settings: &mut Settings) -> Result<(), ()> {
        settings.async_insert_max_data_size = parse_u64(value)?;
        Ok(())
    }

    fn get_as_string(settings: &Settings) -> String {
        settings.async_insert_max_data_size.to_string()
    }
}

pub struct NetworkCompressionMethod;

impl SessionSetting for NetworkCompressionMethod {
    const NAME: &'static str = "network_compression_method";
    const DESCRIPTION: &'static str = "Codec used for compressed blocks";

    fn set_from_str(value: &str, settings: &mut Settings) -> Result<(), ()> {
        settings.network_compression_method = CompressionMethod::from_setting(value).ok_or(())?;
        Ok(())
    }

    fn get_as_string(settings: &Settings) -> String {
        settings.network_compression_method.setting_name().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get() {
        let mut s = Settings::default();
        s.set("interactive_delay", "5000").unwrap();
        assert_eq!(Duration::from_millis(5), s.interactive_delay);
        assert_eq!("5000", s.get("interactive_delay").unwrap());

        s.set("send_logs_level", "Trace").unwrap();
        assert_eq!(LogsLevel::Trace, s.send_logs_level);

        s.set("receive_timeout", "0.5").unwrap();
        assert_eq!(Duration::from_millis(500), s.receive_timeout);

        assert!(s.is_changed("interactive_delay"));
        assert!(!s.is_changed("extremes"));
    }

    #[test]
    fn invalid_values() {
        let mut s = Settings::default();
        assert!(matches!(
            s.set("max_block_size", "0"),
            Err(NativeSrvError::InvalidSettingValue { .. })
        ));
        assert!(matches!(
            s.set("async_insert", "maybe"),
            Err(NativeSrvError::InvalidSettingValue { .. })
        ));
        assert!(matches!(
            s.set("no_such_setting", "1"),
            Err(NativeSrvError::UnknownSetting(_))
        ));
        assert_eq!(Settings::default(), s);
    }

    #[test]
    fn unknown_settings_respect_importance() {
        let mut s = Settings::default();
        s.apply_changes(&[
            SettingChange::new("extremes", "1"),
            SettingChange::new("made_up", "1"),
        ])
        .unwrap();
        assert!(s.extremes);

        let err = s
            .apply_changes(&[
                SettingChange::new("max_block_size", "10"),
                SettingChange::new("made_up", "1").important(),
            ])
            .unwrap_err();
        assert!(matches!(err, NativeSrvError::UnknownSetting(name) if name == "made_up"));
        // The whole batch is rejected.
        assert_eq!(65409, s.max_block_size);
    }

    #[test]
    fn changes_include_custom() {
        let mut s = Settings::default();
        s.set("extremes", "true").unwrap();
        s.apply_changes(&[SettingChange {
            name: "custom_x".to_string(),
            flags: SETTING_FLAG_CUSTOM,
            value: "'y'".to_string(),
        }])
        .unwrap();

        let changes = s.changes();
        assert_eq!(2, changes.len());
        assert_eq!(SettingChange::new("extremes", "1"), changes[0]);
        assert_eq!("custom_x", changes[1].name);
    }

    #[test]
    fn every_setting_formats_its_default() {
        let defaults = Settings::default();
        for name in GET_SET_FUNCTIONS.keys() {
            let value = defaults.get(name).unwrap();
            let mut s = Settings::default();
            s.set(name, &value).unwrap();
            assert_eq!(value, s.get(name).unwrap(), "{name}");
        }
    }
}
