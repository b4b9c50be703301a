//! Payload encoding.
//!
//! Flushed buckets are encoded one per line, in the form of:
//!
//! ```text
//! <bucket start>|<name>|<unit>|<type code>|<values>|<tags>
//! ```
//!
//! where `<bucket start>` is in seconds since the Unix epoch, `<values>` are the `:`-separated values of the bucket, and
//! `<tags>` is the canonical `key:value,key:value` form of the tags (empty if there are none). The values of each metric
//! type are:
//!
//! - counter: the sum
//! - distribution: every value, in the order they were recorded
//! - set: the hash of every unique value
//! - gauge: the last, minimum, maximum, sum, and count, in that order
//!
//! Names, units, tag keys, and tag values are sanitized while encoding so that they never contain a separator. Names,
//! units, and tag keys replace every unsupported character with `_`, so they never encode to an empty field.

use std::fmt::{self, Write as _};

use bytes::Bytes;
use nom::{
    bytes::complete::{take_while, take_while1},
    character::complete::{char, one_of, u64 as parse_u64},
    combinator::eof,
    sequence::terminated,
    IResult, Parser as _,
};
use snafu::{OptionExt as _, ResultExt as _, Snafu};

use crate::{AggregationState, BucketKey, GaugeSummary, MetricType, MetricUnit, TagSet};

/// An encoded flush payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EncodedMetricsBatch {
    payload: Bytes,
    buckets: usize,
}

impl EncodedMetricsBatch {
    /// Returns the encoded payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consumes the batch, returning the encoded payload.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Returns the number of buckets in the payload.
    pub fn bucket_count(&self) -> usize {
        self.buckets
    }

    /// Returns the size of the payload, in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Returns `true` if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Encodes the given buckets into a payload.
pub fn encode_payload<'a, I>(buckets: I) -> EncodedMetricsBatch
where
    I: IntoIterator<Item = (&'a BucketKey, &'a AggregationState)>,
{
    let mut buf = String::new();
    let mut count = 0;

    for (key, state) in buckets {
        // Writing into a `String` can't fail.
        let _ = write_bucket(&mut buf, key, state);
        count += 1;
    }

    EncodedMetricsBatch {
        payload: Bytes::from(buf),
        buckets: count,
    }
}

fn write_bucket(buf: &mut String, key: &BucketKey, state: &AggregationState) -> fmt::Result {
    let unit = match key.unit().as_str() {
        "" => MetricUnit::None.as_str(),
        unit => unit,
    };
    write!(
        buf,
        "{}|{}|{}|{}|",
        key.timestamp(),
        SanitizedKey(key.name()),
        SanitizedKey(unit),
        state.metric_type().code()
    )?;

    match state {
        AggregationState::Counter(sum) => write!(buf, "{}", sum)?,
        AggregationState::Distribution(values) => write_joined(buf, values.iter())?,
        AggregationState::Set(hashes) => write_joined(buf, hashes.iter())?,
        AggregationState::Gauge(summary) => write!(
            buf,
            "{}:{}:{}:{}:{}",
            summary.last(),
            summary.min(),
            summary.max(),
            summary.sum(),
            summary.count()
        )?,
    }

    buf.push('|');
    for (idx, (key, value)) in key.tags().iter().enumerate() {
        if idx > 0 {
            buf.push(',');
        }
        write!(buf, "{}:{}", SanitizedKey(key), SanitizedValue(value))?;
    }
    buf.push('\n');

    Ok(())
}

fn write_joined<I, T>(buf: &mut String, values: I) -> fmt::Result
where
    I: Iterator<Item = T>,
    T: fmt::Display,
{
    for (idx, value) in values.enumerate() {
        if idx > 0 {
            buf.push(':');
        }
        write!(buf, "{}", value)?;
    }
    Ok(())
}

struct SanitizedKey<'a>(&'a str);

impl fmt::Display for SanitizedKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.chars() {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/') {
                f.write_char(c)?;
            } else {
                f.write_char('_')?;
            }
        }
        Ok(())
    }
}

struct SanitizedValue<'a>(&'a str);

impl fmt::Display for SanitizedValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.chars() {
            if c.is_alphanumeric() || matches!(c, '_' | ':' | '/' | '@' | '.' | '{' | '}' | '[' | ']' | '$' | '-') {
                f.write_char(c)?;
            }
        }
        Ok(())
    }
}

/// A payload decoding error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum DecodeError {
    /// The payload was not valid UTF-8.
    #[snafu(display("Payload is not valid UTF-8."))]
    InvalidUtf8 {
        /// Error source.
        source: std::str::Utf8Error,
    },

    /// A line did not have the expected structure.
    #[snafu(display("Malformed bucket on line {}.", line))]
    MalformedLine {
        /// Line number, starting at 1.
        line: usize,
    },

    /// A value could not be parsed for the bucket's metric type.
    #[snafu(display("Invalid value '{}' on line {}.", value, line))]
    InvalidValue {
        /// Line number, starting at 1.
        line: usize,

        /// The offending value.
        value: String,
    },

    /// A bucket had the wrong number of values for its metric type.
    #[snafu(display("Expected {} value(s) on line {}, got {}.", expected, line, actual))]
    InvalidValueCount {
        /// Line number, starting at 1.
        line: usize,

        /// Number of values expected.
        expected: usize,

        /// Number of values found.
        actual: usize,
    },

    /// A tag was not in the `key:value` form.
    #[snafu(display("Invalid tag '{}' on line {}.", tag, line))]
    InvalidTag {
        /// Line number, starting at 1.
        line: usize,

        /// The offending tag.
        tag: String,
    },
}

/// Values of a decoded bucket.
#[derive(Clone, Debug, PartialEq)]
pub enum DecodedValues {
    /// Counter sum.
    Counter(f64),

    /// Distribution values, in encoded order.
    Distribution(Vec<f64>),

    /// Set hashes, in encoded order.
    Set(Vec<u64>),

    /// Gauge summary.
    Gauge(GaugeSummary),
}

/// A bucket decoded from a payload.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedBucket {
    /// Start of the bucket, in seconds since the Unix epoch.
    pub timestamp: u64,

    /// Metric name.
    pub name: String,

    /// Metric unit.
    pub unit: MetricUnit,

    /// Metric type.
    pub metric_type: MetricType,

    /// Bucket values.
    pub values: DecodedValues,

    /// Metric tags.
    pub tags: TagSet,
}

struct RawBucket<'a> {
    timestamp: u64,
    name: &'a str,
    unit: &'a str,
    type_code: char,
    values: &'a str,
    tags: &'a str,
}

/// Decodes a payload produced by [`encode_payload`].
///
/// # Errors
///
/// If the payload is not valid UTF-8, or any line is malformed, an error is returned.
pub fn decode_payload(payload: &[u8]) -> Result<Vec<DecodedBucket>, DecodeError> {
    let payload = std::str::from_utf8(payload).context(InvalidUtf8)?;

    payload
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.is_empty())
        .map(|(idx, line)| decode_line(idx + 1, line))
        .collect()
}

fn decode_line(line_no: usize, line: &str) -> Result<DecodedBucket, DecodeError> {
    let (_, raw) = raw_bucket(line).map_err(|_| MalformedLine { line: line_no }.build())?;
    let metric_type = MetricType::from_code(raw.type_code).context(MalformedLine { line: line_no })?;

    let values = match metric_type {
        MetricType::Counter => {
            let values = parse_values::<f64>(line_no, raw.values)?;
            let [sum] = exact_values::<1, _>(line_no, values)?;
            DecodedValues::Counter(sum)
        }
        MetricType::Distribution => DecodedValues::Distribution(parse_values(line_no, raw.values)?),
        MetricType::Set => DecodedValues::Set(parse_values(line_no, raw.values)?),
        MetricType::Gauge => {
            let values = parse_values::<f64>(line_no, raw.values)?;
            let [last, min, max, sum, count] = exact_values::<5, _>(line_no, values)?;
            DecodedValues::Gauge(GaugeSummary::from_parts(last, min, max, sum, count as u64))
        }
    };

    let mut tags = TagSet::new();
    if !raw.tags.is_empty() {
        for tag in raw.tags.split(',') {
            let (key, value) = tag.split_once(':').context(InvalidTag { line: line_no, tag })?;
            tags.insert(key, value);
        }
    }

    Ok(DecodedBucket {
        timestamp: raw.timestamp,
        name: raw.name.to_string(),
        unit: raw.unit.into(),
        metric_type,
        values,
        tags,
    })
}

fn parse_values<T: std::str::FromStr>(line_no: usize, raw: &str) -> Result<Vec<T>, DecodeError> {
    raw.split(':')
        .map(|value| {
            value
                .parse::<T>()
                .map_err(|_| InvalidValue { line: line_no, value }.build())
        })
        .collect()
}

fn exact_values<const N: usize, T>(line_no: usize, values: Vec<T>) -> Result<[T; N], DecodeError> {
    let actual = values.len();
    values.try_into().map_err(|_| {
        InvalidValueCount {
            line: line_no,
            expected: N,
            actual,
        }
        .build()
    })
}

fn is_field_char(c: char) -> bool {
    c != '|'
}

fn field(input: &str) -> IResult<&str, &str> {
    terminated(take_while1(is_field_char), char('|')).parse(input)
}

fn trailing_field(input: &str) -> IResult<&str, &str> {
    terminated(take_while(is_field_char), eof).parse(input)
}

fn raw_bucket(input: &str) -> IResult<&str, RawBucket<'_>> {
    let (input, timestamp) = terminated(parse_u64, char('|')).parse(input)?;
    let (input, name) = field(input)?;
    let (input, unit) = field(input)?;
    let (input, type_code) = terminated(one_of("cdsg"), char('|')).parse(input)?;
    let (input, values) = field(input)?;
    let (input, tags) = trailing_field(input)?;

    Ok((
        input,
        RawBucket {
            timestamp,
            name,
            unit,
            type_code,
            values,
            tags,
        },
    ))
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, time::Duration};

    use proptest::{collection::vec as arb_vec, prelude::*};

    use super::*;
    use crate::{state::MetricValue, DurationUnit, SetValue};

    const ROLLUP: Duration = Duration::from_secs(10);

    fn key(metric_type: MetricType, name: &str, unit: MetricUnit, tags: TagSet) -> BucketKey {
        BucketKey::derive(metric_type, name, unit, tags, Duration::from_secs(1_700_000_003), ROLLUP)
    }

    fn payload_str(batch: &EncodedMetricsBatch) -> &str {
        std::str::from_utf8(batch.payload()).unwrap()
    }

    #[test]
    fn encodes_each_type() {
        let mut set = AggregationState::new(MetricValue::Set(SetValue::from(7i64).to_hash()));
        set.add(MetricValue::Set(SetValue::from(3i64).to_hash()));

        let mut gauge = AggregationState::new(MetricValue::Gauge(2.0));
        gauge.add(MetricValue::Gauge(4.5));

        let mut dist = AggregationState::new(MetricValue::Distribution(1.0));
        dist.add(MetricValue::Distribution(0.25));

        let buckets = [
            (
                key(MetricType::Counter, "hits", MetricUnit::None, TagSet::from([("b", "2"), ("a", "1")])),
                AggregationState::new(MetricValue::Counter(3.0)),
            ),
            (
                key(MetricType::Distribution, "latency", DurationUnit::MilliSecond.into(), TagSet::new()),
                dist,
            ),
            (key(MetricType::Set, "users", MetricUnit::None, TagSet::new()), set),
            (key(MetricType::Gauge, "queue", MetricUnit::None, TagSet::new()), gauge),
        ];

        let batch = encode_payload(buckets.iter().map(|(k, s)| (k, s)));
        assert_eq!(batch.bucket_count(), 4);
        assert_eq!(
            payload_str(&batch),
            "1700000000|hits|none|c|3|a:1,b:2\n\
             1700000000|latency|millisecond|d|1:0.25|\n\
             1700000000|users|none|s|3:7|\n\
             1700000000|queue|none|g|4.5:2:4.5:6.5:2|\n"
        );
    }

    #[test]
    fn sanitizes_separators() {
        let key = key(
            MetricType::Counter,
            "my|metric:name,x y",
            MetricUnit::custom("req|s"),
            TagSet::from([("k|e,y:", "v|a,l:ue\nz")]),
        );
        let state = AggregationState::new(MetricValue::Counter(1.0));

        let batch = encode_payload([(&key, &state)]);
        assert_eq!(
            payload_str(&batch),
            "1700000000|my_metric_name_x_y|req_s|c|1|k_e_y_:val:uez\n"
        );

        let decoded = decode_payload(batch.payload()).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].tags.get("k_e_y_"), Some("val:uez"));
    }

    #[test]
    fn non_ascii_names_and_units_stay_decodable() {
        let key = key(
            MetricType::Counter,
            "запросы",
            MetricUnit::custom("%"),
            TagSet::from([("✓", "ok")]),
        );
        let state = AggregationState::new(MetricValue::Counter(1.0));

        let batch = encode_payload([(&key, &state)]);
        assert_eq!(payload_str(&batch), "1700000000|_______|_|c|1|_:ok\n");

        let decoded = decode_payload(batch.payload()).unwrap();
        assert_eq!(decoded[0].name, "_______");
        assert_eq!(decoded[0].unit, MetricUnit::custom("_"));
        assert_eq!(decoded[0].tags.get("_"), Some("ok"));
    }

    #[test]
    fn empty_custom_unit_encodes_as_none() {
        let key = key(MetricType::Counter, "hits", MetricUnit::custom(""), TagSet::new());
        let state = AggregationState::new(MetricValue::Counter(1.0));

        let batch = encode_payload([(&key, &state)]);
        assert_eq!(payload_str(&batch), "1700000000|hits|none|c|1|\n");
        assert_eq!(decode_payload(batch.payload()).unwrap()[0].unit, MetricUnit::None);
    }

    #[test]
    fn empty_payload_decodes_to_nothing() {
        let batch = encode_payload(std::iter::empty());
        assert!(batch.is_empty());
        assert!(decode_payload(batch.payload()).unwrap().is_empty());
    }

    #[test]
    fn decode_errors() {
        let cases: [(&[u8], fn(&DecodeError) -> bool); 6] = [
            (b"\xff\xfe", |e| matches!(e, DecodeError::InvalidUtf8 { .. })),
            (b"10|name|none|x|1|", |e| matches!(e, DecodeError::MalformedLine { line: 1 })),
            (b"10|name|none|c|1|\nnot a bucket", |e| {
                matches!(e, DecodeError::MalformedLine { line: 2 })
            }),
            (b"10|name|none|c|abc|", |e| matches!(e, DecodeError::InvalidValue { line: 1, .. })),
            (b"10|name|none|g|1:2|", |e| {
                matches!(e, DecodeError::InvalidValueCount { expected: 5, actual: 2, .. })
            }),
            (b"10|name|none|c|1|novalue", |e| matches!(e, DecodeError::InvalidTag { .. })),
        ];

        for (input, check) in cases {
            let err = decode_payload(input).unwrap_err();
            assert!(check(&err), "unexpected error for {:?}: {:?}", input, err);
        }
    }

    fn arb_name() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9_./-]{1,16}"
    }

    fn sanitized_name(name: &str) -> String {
        SanitizedKey(name).to_string()
    }

    fn arb_tags() -> impl Strategy<Value = TagSet> {
        proptest::collection::btree_map("[a-z_]{1,8}", "[a-zA-Z0-9_:@.-]{0,12}", 0..4)
            .prop_map(|tags| tags.into_iter().collect())
    }

    fn arb_state() -> impl Strategy<Value = AggregationState> {
        let finite = -1.0e12f64..1.0e12f64;
        prop_oneof![
            finite.clone().prop_map(|v| AggregationState::new(MetricValue::Counter(v))),
            arb_vec(finite.clone(), 1..32).prop_map(AggregationState::Distribution),
            proptest::collection::btree_set(any::<u64>(), 1..32).prop_map(AggregationState::Set),
            arb_vec(finite, 1..8).prop_map(|values| {
                let mut state = AggregationState::new(MetricValue::Gauge(values[0]));
                for v in &values[1..] {
                    state.add(MetricValue::Gauge(*v));
                }
                state
            }),
        ]
    }

    fn assert_round_trip(key: &BucketKey, state: &AggregationState, decoded: &DecodedBucket) {
        assert_eq!(decoded.timestamp, key.timestamp());
        assert_eq!(decoded.name, key.name());
        assert_eq!(&decoded.unit, key.unit());
        assert_eq!(decoded.metric_type, state.metric_type());
        assert_eq!(&decoded.tags, key.tags());

        match (state, &decoded.values) {
            (AggregationState::Counter(a), DecodedValues::Counter(b)) => assert_eq!(a, b),
            (AggregationState::Distribution(a), DecodedValues::Distribution(b)) => assert_eq!(a, b),
            (AggregationState::Set(a), DecodedValues::Set(b)) => {
                assert_eq!(a, &b.iter().copied().collect::<BTreeSet<_>>())
            }
            (AggregationState::Gauge(a), DecodedValues::Gauge(b)) => assert_eq!(a, b),
            (state, values) => panic!("mismatched state {:?} and decoded values {:?}", state, values),
        }
    }

    proptest! {
        #[test]
        fn property_test_round_trip(
            buckets in arb_vec((arb_name(), arb_tags(), arb_state(), 0u64..4_000_000_000), 1..16)
        ) {
            let buckets = buckets
                .into_iter()
                .map(|(name, tags, state, ts)| {
                    let key = BucketKey::derive(
                        state.metric_type(),
                        &name,
                        MetricUnit::None,
                        tags,
                        Duration::from_secs(ts),
                        ROLLUP,
                    );
                    (key, state)
                })
                .collect::<Vec<_>>();

            let batch = encode_payload(buckets.iter().map(|(k, s)| (k, s)));
            let decoded = decode_payload(batch.payload()).unwrap();

            prop_assert_eq!(decoded.len(), buckets.len());
            for ((key, state), decoded) in buckets.iter().zip(decoded.iter()) {
                assert_round_trip(key, state, decoded);
            }
        }

        #[test]
        fn property_test_any_name_decodes_to_sanitized_name(name in "\\PC{1,24}", unit in "\\PC{1,8}") {
            let key = BucketKey::derive(
                MetricType::Counter,
                &name,
                MetricUnit::custom(unit.clone()),
                TagSet::new(),
                Duration::from_secs(1_700_000_000),
                ROLLUP,
            );
            let state = AggregationState::new(MetricValue::Counter(1.0));

            let batch = encode_payload([(&key, &state)]);
            let decoded = decode_payload(batch.payload()).unwrap();

            prop_assert_eq!(decoded.len(), 1);
            prop_assert_eq!(&decoded[0].name, &sanitized_name(&name));
            let expected_unit = MetricUnit::from(sanitized_name(&unit).as_str());
            prop_assert_eq!(decoded[0].unit.as_str(), expected_unit.as_str());
        }

        #[test]
        fn property_test_malformed_input_does_not_panic(input in arb_vec(any::<u8>(), 0..512)) {
            let _ = decode_payload(&input);
        }
    }
}
