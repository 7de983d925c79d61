//! BM13xx ASIC chain support: wire protocol, CRC helpers, and the chain
//! driver that brings up and feeds the daisy-chained chips.

pub mod chain;
pub mod crc;
pub mod error;
pub mod protocol;

use std::time::Duration;

/// Supported chip models.
///
/// The chain driver is selected at startup from this tag; each variant
/// carries the model-specific constants that used to live behind a
/// function-pointer table in older firmware.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString, strum::EnumIter,
)]
pub enum AsicModel {
    #[strum(serialize = "BM1366")]
    Bm1366,
    #[strum(serialize = "BM1368")]
    Bm1368,
    #[strum(serialize = "BM1370")]
    Bm1370,
    #[strum(serialize = "BM1397")]
    Bm1397,
}

/// Which job payload the chip expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobFormat {
    /// Full 80-byte header material; the chip derives midstates itself.
    FullHeader,
    /// Host-computed midstates plus the header tail.
    Midstates,
}

impl AsicModel {
    /// Number of small cores on the die, used for hashrate accounting.
    pub fn small_core_count(&self) -> u32 {
        match self {
            Self::Bm1366 => 894,
            Self::Bm1368 => 1276,
            Self::Bm1370 => 2040,
            Self::Bm1397 => 672,
        }
    }

    /// Default ticket-mask difficulty written during bring-up.
    pub fn default_difficulty(&self) -> u32 {
        match self {
            Self::Bm1366 | Self::Bm1368 | Self::Bm1397 => 256,
            Self::Bm1370 => 512,
        }
    }

    /// How often the job creator feeds a fresh job to the chain.
    pub fn job_interval(&self) -> Duration {
        match self {
            Self::Bm1366 => Duration::from_millis(1500),
            Self::Bm1368 => Duration::from_millis(1200),
            Self::Bm1370 => Duration::from_millis(750),
            Self::Bm1397 => Duration::from_millis(500),
        }
    }

    /// Job payload format for this chip.
    pub fn job_format(&self) -> JobFormat {
        match self {
            Self::Bm1397 => JobFormat::Midstates,
            _ => JobFormat::FullHeader,
        }
    }

    /// Number of midstates shipped per job when version rolling is active.
    ///
    /// Midstate-format chips take four pre-rolled midstates; full-header
    /// chips roll the version themselves and take one.
    pub fn midstates_per_job(&self, version_rolling: bool) -> u8 {
        match self.job_format() {
            JobFormat::Midstates if version_rolling => 4,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn model_names_round_trip() {
        for model in AsicModel::iter() {
            let name = model.to_string();
            assert_eq!(name.parse::<AsicModel>().unwrap(), model);
        }
        assert!("BM1399".parse::<AsicModel>().is_err());
    }

    #[test]
    fn midstate_counts() {
        assert_eq!(AsicModel::Bm1397.midstates_per_job(true), 4);
        assert_eq!(AsicModel::Bm1397.midstates_per_job(false), 1);
        assert_eq!(AsicModel::Bm1366.midstates_per_job(true), 1);
        assert_eq!(AsicModel::Bm1370.job_format(), JobFormat::FullHeader);
    }

    #[test]
    fn default_difficulty_is_power_of_two() {
        for model in AsicModel::iter() {
            let d = model.default_difficulty();
            assert_eq!(d.count_ones(), 1, "{model} difficulty {d}");
        }
    }
}
