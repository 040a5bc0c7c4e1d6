//! Output file and directory names
//!
//! `PREFIX-20130717_000900-1374008940.ts`, optionally linked under
//! `2013/07/17/00/`. Calendar fields use the rotator's time zone.

use chrono::{DateTime, TimeZone, Utc};
use std::fmt;
use std::path::PathBuf;

/// Names generated for one output file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputNames {
    /// Epoch seconds the names were generated for
    pub start: i64,
    /// Top-level file name
    pub file_name: String,
    /// `YYYY/MM/DD/HH`, relative to the output directory
    pub dir_name: PathBuf,
}

impl OutputNames {
    /// Generate names for `epoch_secs` in time zone `tz`
    pub fn for_time<Tz>(prefix: &str, epoch_secs: i64, tz: &Tz) -> Self
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        let utc = DateTime::<Utc>::from_timestamp(epoch_secs, 0).unwrap_or_default();
        let local = utc.with_timezone(tz);

        Self {
            start: epoch_secs,
            file_name: format!("{}-{}-{}.ts", prefix, local.format("%Y%m%d_%H%M%S"), epoch_secs),
            dir_name: PathBuf::from(local.format("%Y/%m/%d/%H").to_string()),
        }
    }

    /// Subdirectory path the file is hard-linked to
    pub fn linked_path(&self) -> PathBuf {
        self.dir_name.join(&self.file_name)
    }
}

/// Round `epoch_secs` down to a multiple of `interval`
pub fn align_down(epoch_secs: i64, interval: i64) -> i64 {
    epoch_secs - epoch_secs.rem_euclid(interval)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    #[test]
    fn test_file_name_layout() {
        let names = OutputNames::for_time("PREFIX", 1374008940, &Utc);

        assert_eq!(names.file_name, "PREFIX-20130716_210900-1374008940.ts");
        assert_eq!(names.dir_name, PathBuf::from("2013/07/16/21"));
        assert_eq!(
            names.linked_path(),
            PathBuf::from("2013/07/16/21/PREFIX-20130716_210900-1374008940.ts")
        );
    }

    #[test]
    fn test_time_zone_changes_calendar_fields_only() {
        let tz = FixedOffset::east_opt(3 * 3600).unwrap();
        let names = OutputNames::for_time("PREFIX", 1374008940, &tz);

        assert_eq!(names.file_name, "PREFIX-20130717_000900-1374008940.ts");
        assert_eq!(names.dir_name, PathBuf::from("2013/07/17/00"));
        assert_eq!(names.start, 1374008940);
    }

    #[test]
    fn test_align_down() {
        assert_eq!(align_down(1374008940, 60), 1374008940);
        assert_eq!(align_down(1374008999, 60), 1374008940);
        assert_eq!(align_down(1374009000, 60), 1374009000);
        assert_eq!(align_down(125, 3600), 0);
        assert_eq!(align_down(-1, 60), -60);
    }
}
