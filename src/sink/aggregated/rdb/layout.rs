use serde::Deserialize;

/// Number of minute columns per row (`m0`..`m59`).
pub const ROW_SLOTS: usize = 60;

/// Minutes covered by one row under the daily layout.
pub const DAILY_ROW_MINUTES: i64 = 1440;

/// Mask applied to every slot index before it names a column.
pub const ROW_SLOT_MASK: i64 = (1 << 11) - 1;

/// How a minute maps onto a row and one of its value columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowLayout {
    /// One row per day; the column is the minute of the hour, so the 24
    /// hours of a day accumulate into the same 60 columns.
    #[default]
    Daily,
    /// One row per hour; the column is the minute of the hour.
    Hourly,
}

/// Location of one minute in the row store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RowAddress {
    pub base_time: i64,
    /// Column index in `0..ROW_SLOTS`.
    pub slot: usize,
}

impl RowLayout {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Hourly => "hourly",
        }
    }

    /// Locate the row and column for a unix time in seconds.
    pub fn address(self, time: i64) -> RowAddress {
        let minute = time.div_euclid(60);
        let base_time = match self {
            Self::Daily => minute.div_euclid(DAILY_ROW_MINUTES),
            Self::Hourly => minute.div_euclid(60),
        };
        let slot = (minute.rem_euclid(60) & ROW_SLOT_MASK) as usize;

        RowAddress { base_time, slot }
    }

    /// Returns true if distinct minutes can share one column.
    pub const fn is_lossy(self) -> bool {
        matches!(self, Self::Daily)
    }
}

/// Column name of a slot.
pub fn slot_column(slot: usize) -> String {
    format!("m{slot}")
}
