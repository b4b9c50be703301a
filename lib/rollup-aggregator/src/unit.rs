//! Measurement units.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

macro_rules! unit_enum {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident => $repr:literal,)+ }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
        pub enum $name {
            $($(#[$vmeta])* $variant,)+
        }

        impl $name {
            /// Returns the canonical string form of this unit.
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $repr,)+
                }
            }

            fn parse(s: &str) -> Option<Self> {
                match s {
                    $($repr => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

unit_enum!(
    /// Time duration units.
    DurationUnit {
        /// Nanoseconds (10^-9 seconds).
        NanoSecond => "nanosecond",
        /// Microseconds (10^-6 seconds).
        MicroSecond => "microsecond",
        /// Milliseconds (10^-3 seconds).
        MilliSecond => "millisecond",
        /// Whole seconds.
        Second => "second",
        /// Minutes (60 seconds).
        Minute => "minute",
        /// Hours (3600 seconds).
        Hour => "hour",
        /// Days (86,400 seconds).
        Day => "day",
        /// Weeks (604,800 seconds).
        Week => "week",
    }
);

unit_enum!(
    /// Size of information, in bits or bytes.
    ///
    /// Decimal prefixes are multiples of 1000, binary prefixes are multiples of 1024.
    InformationUnit {
        /// A single bit.
        Bit => "bit",
        /// Eight bits.
        Byte => "byte",
        /// 1000 bytes.
        KiloByte => "kilobyte",
        /// 1024 bytes.
        KibiByte => "kibibyte",
        /// 1000^2 bytes.
        MegaByte => "megabyte",
        /// 1024^2 bytes.
        MebiByte => "mebibyte",
        /// 1000^3 bytes.
        GigaByte => "gigabyte",
        /// 1024^3 bytes.
        GibiByte => "gibibyte",
        /// 1000^4 bytes.
        TeraByte => "terabyte",
        /// 1024^4 bytes.
        TebiByte => "tebibyte",
        /// 1000^5 bytes.
        PetaByte => "petabyte",
        /// 1024^5 bytes.
        PebiByte => "pebibyte",
        /// 1000^6 bytes.
        ExaByte => "exabyte",
        /// 1024^6 bytes.
        ExbiByte => "exbibyte",
    }
);

unit_enum!(
    /// Fractions such as percentages.
    FractionUnit {
        /// Floating point fraction of `1`.
        Ratio => "ratio",
        /// Ratio expressed as a fraction of `100`.
        Percent => "percent",
    }
);

/// The unit of measurement of a metric value.
///
/// Units are part of a metric's identity: the same metric name emitted with two different units is aggregated into two
/// different buckets. Any string that is not part of the predefined taxonomy is carried as a custom unit.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum MetricUnit {
    /// No unit.
    #[default]
    None,

    /// A time duration.
    Duration(DurationUnit),

    /// Size of information.
    Information(InformationUnit),

    /// A fraction.
    Fraction(FractionUnit),

    /// A user-defined unit.
    Custom(String),
}

impl MetricUnit {
    /// Creates a custom unit.
    pub fn custom<S: Into<String>>(unit: S) -> Self {
        Self::Custom(unit.into())
    }

    /// Returns `true` if this is the default, empty unit.
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Returns the canonical string form of this unit.
    pub fn as_str(&self) -> &str {
        match self {
            Self::None => "none",
            Self::Duration(unit) => unit.as_str(),
            Self::Information(unit) => unit.as_str(),
            Self::Fraction(unit) => unit.as_str(),
            Self::Custom(unit) => unit,
        }
    }
}

impl fmt::Display for MetricUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricUnit {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s == "none" {
            return Ok(Self::None);
        }

        let unit = DurationUnit::parse(s)
            .map(Self::Duration)
            .or_else(|| InformationUnit::parse(s).map(Self::Information))
            .or_else(|| FractionUnit::parse(s).map(Self::Fraction))
            .unwrap_or_else(|| Self::Custom(s.to_string()));

        Ok(unit)
    }
}

impl From<String> for MetricUnit {
    fn from(s: String) -> Self {
        match s.parse() {
            Ok(unit) => unit,
            Err(never) => match never {},
        }
    }
}

impl<'a> From<&'a str> for MetricUnit {
    fn from(s: &'a str) -> Self {
        match s.parse() {
            Ok(unit) => unit,
            Err(never) => match never {},
        }
    }
}

impl From<MetricUnit> for String {
    fn from(unit: MetricUnit) -> Self {
        match unit {
            MetricUnit::Custom(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

impl From<DurationUnit> for MetricUnit {
    fn from(unit: DurationUnit) -> Self {
        Self::Duration(unit)
    }
}

impl From<InformationUnit> for MetricUnit {
    fn from(unit: InformationUnit) -> Self {
        Self::Information(unit)
    }
}

impl From<FractionUnit> for MetricUnit {
    fn from(unit: FractionUnit) -> Self {
        Self::Fraction(unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_taxonomy_members() {
        let cases = [
            ("none", MetricUnit::None),
            ("", MetricUnit::None),
            ("millisecond", MetricUnit::Duration(DurationUnit::MilliSecond)),
            ("kibibyte", MetricUnit::Information(InformationUnit::KibiByte)),
            ("percent", MetricUnit::Fraction(FractionUnit::Percent)),
            ("widgets", MetricUnit::custom("widgets")),
        ];

        for (input, expected) in cases {
            assert_eq!(input.parse::<MetricUnit>().unwrap(), expected, "input: {:?}", input);
        }
    }

    #[test]
    fn display_is_canonical_form() {
        assert_eq!(MetricUnit::default().to_string(), "none");
        assert_eq!(MetricUnit::from(DurationUnit::Second).to_string(), "second");
        assert_eq!(MetricUnit::custom("requests").to_string(), "requests");
    }

    #[test]
    fn canonical_form_round_trips() {
        let units = [
            MetricUnit::None,
            DurationUnit::Week.into(),
            InformationUnit::ExbiByte.into(),
            FractionUnit::Ratio.into(),
            MetricUnit::custom("rows"),
        ];

        for unit in units {
            let reparsed: MetricUnit = unit.to_string().parse().unwrap();
            assert_eq!(reparsed, unit);
        }
    }
}
