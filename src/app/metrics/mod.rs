//! Progress markers printed by training jobs.
//!
//! Jobs emit compact machine-readable markers (`LOSS:<epoch>,<loss>` and
//! `WEIGHTS:<epoch>,<w1>,<w2>`). Older jobs only print human-readable
//! progress (`Epoch 3/100, Loss: 0.25` or `epoch 3 loss: 0.25`), which is
//! still understood. Markers may appear anywhere in a line.

use serde::{Deserialize, Serialize};

const LOSS_MARKER: &str = "LOSS:";
const WEIGHTS_MARKER: &str = "WEIGHTS:";
const LEGACY_EPOCH: &str = "Epoch";
const LEGACY_EPOCH_LOWER: &str = "epoch";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossSample {
    pub epoch: u64,
    pub loss: f64,
    /// Only known when the job prints `Epoch X/Y`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_epochs: Option<u64>,
}

impl LossSample {
    pub fn new(epoch: u64, loss: f64) -> Self {
        Self {
            epoch,
            loss,
            total_epochs: None,
        }
    }

    pub fn progress_percent(&self) -> Option<f64> {
        self.total_epochs
            .filter(|total| *total > 0)
            .map(|total| self.epoch as f64 * 100.0 / total as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightSample {
    pub epoch: u64,
    pub w1: f64,
    pub w2: f64,
}

/// A recognized progress marker. Unrecognized lines never become a `Sample`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sample {
    Loss(LossSample),
    Weights(WeightSample),
}

impl Sample {
    pub fn epoch(&self) -> u64 {
        match self {
            Sample::Loss(sample) => sample.epoch,
            Sample::Weights(sample) => sample.epoch,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressSample {
    Loss(LossSample),
    Weights(WeightSample),
    Unrecognized,
}

impl ProgressSample {
    pub fn into_sample(self) -> Option<Sample> {
        match self {
            ProgressSample::Loss(sample) => Some(Sample::Loss(sample)),
            ProgressSample::Weights(sample) => Some(Sample::Weights(sample)),
            ProgressSample::Unrecognized => None,
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, ProgressSample::Unrecognized)
    }
}

/// Parses one line of job output. Never fails: anything that is not a
/// complete, numerically valid marker is `Unrecognized`.
pub fn parse(line: &str) -> ProgressSample {
    let matchers: [fn(&str) -> Option<Option<ProgressSample>>; 4] =
        [match_loss, match_weights, match_legacy_epoch, match_legacy_lower];
    for matcher in matchers {
        if let Some(result) = matcher(line) {
            return result.unwrap_or(ProgressSample::Unrecognized);
        }
    }
    ProgressSample::Unrecognized
}

/// Outer `None`: the pattern does not occur in the line.
/// Inner `None`: it occurs but a number inside it does not parse.
type Matched = Option<Option<ProgressSample>>;

fn match_loss(line: &str) -> Matched {
    first_occurrence(line, LOSS_MARKER, |cursor| {
        let epoch = cursor.digits()?;
        cursor.literal(",")?;
        let loss = cursor.float(false)?;
        Some(move || {
            Some(ProgressSample::Loss(LossSample::new(
                epoch.parse().ok()?,
                loss.parse().ok()?,
            )))
        })
    })
}

fn match_weights(line: &str) -> Matched {
    first_occurrence(line, WEIGHTS_MARKER, |cursor| {
        let epoch = cursor.digits()?;
        cursor.literal(",")?;
        let w1 = cursor.float(true)?;
        cursor.literal(",")?;
        let w2 = cursor.float(true)?;
        Some(move || {
            Some(ProgressSample::Weights(WeightSample {
                epoch: epoch.parse().ok()?,
                w1: w1.parse().ok()?,
                w2: w2.parse().ok()?,
            }))
        })
    })
}

// `Epoch <e>/<total>, Loss: <loss>`
fn match_legacy_epoch(line: &str) -> Matched {
    first_occurrence(line, LEGACY_EPOCH, |cursor| {
        cursor.whitespace()?;
        let epoch = cursor.digits()?;
        cursor.literal("/")?;
        let total = cursor.digits()?;
        cursor.literal(",")?;
        cursor.whitespace()?;
        cursor.literal("Loss:")?;
        cursor.whitespace()?;
        let loss = cursor.float(false)?;
        Some(move || {
            Some(ProgressSample::Loss(LossSample {
                epoch: epoch.parse().ok()?,
                loss: loss.parse().ok()?,
                total_epochs: Some(total.parse().ok()?),
            }))
        })
    })
}

// `epoch <e> loss: <loss>`
fn match_legacy_lower(line: &str) -> Matched {
    first_occurrence(line, LEGACY_EPOCH_LOWER, |cursor| {
        cursor.whitespace()?;
        let epoch = cursor.digits()?;
        cursor.whitespace()?;
        cursor.literal("loss:")?;
        cursor.whitespace()?;
        let loss = cursor.float(false)?;
        Some(move || {
            Some(ProgressSample::Loss(LossSample::new(
                epoch.parse().ok()?,
                loss.parse().ok()?,
            )))
        })
    })
}

/// Tries `shape` after every occurrence of `marker`; the first occurrence
/// whose text has the right shape decides the result. Shape matching and
/// numeric conversion are split so that a well-shaped marker with an
/// unparseable number still counts as a match.
fn first_occurrence<'a, S, C>(line: &'a str, marker: &str, shape: S) -> Matched
where
    S: Fn(&mut Cursor<'a>) -> Option<C>,
    C: FnOnce() -> Option<ProgressSample>,
{
    for (index, _) in line.match_indices(marker) {
        let mut cursor = Cursor {
            rest: &line[index + marker.len()..],
        };
        if let Some(convert) = shape(&mut cursor) {
            return Some(convert());
        }
    }
    None
}

struct Cursor<'a> {
    rest: &'a str,
}

impl<'a> Cursor<'a> {
    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> &'a str {
        let end = self
            .rest
            .char_indices()
            .find(|(_, ch)| !pred(*ch))
            .map(|(idx, _)| idx)
            .unwrap_or(self.rest.len());
        let (head, tail) = self.rest.split_at(end);
        self.rest = tail;
        head
    }

    fn literal(&mut self, text: &str) -> Option<()> {
        self.rest = self.rest.strip_prefix(text)?;
        Some(())
    }

    /// One or more whitespace characters.
    fn whitespace(&mut self) -> Option<()> {
        let taken = self.take_while(char::is_whitespace);
        (!taken.is_empty()).then_some(())
    }

    fn digits(&mut self) -> Option<&'a str> {
        let taken = self.take_while(|ch| ch.is_ascii_digit());
        (!taken.is_empty()).then_some(taken)
    }

    /// A float-looking token: optional sign (when `signed`), digits and
    /// dots, optional exponent. Whether it is a valid number is decided later.
    fn float(&mut self, signed: bool) -> Option<&'a str> {
        let start = self.rest;
        let mut len = 0;
        if signed && (self.rest.starts_with('-') || self.rest.starts_with('+')) {
            len += 1;
        }
        let body = start[len..]
            .chars()
            .take_while(|ch| ch.is_ascii_digit() || *ch == '.')
            .count();
        if body == 0 {
            return None;
        }
        len += body;
        let after = &start[len..];
        if let Some(exp) = after.strip_prefix(['e', 'E']) {
            let sign = usize::from(exp.starts_with(['-', '+']));
            let exp_digits = exp[sign..].chars().take_while(char::is_ascii_digit).count();
            if exp_digits > 0 {
                len += 1 + sign + exp_digits;
            }
        }
        let (token, rest) = start.split_at(len);
        self.rest = rest;
        Some(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_loss_marker_round_trips_values() {
        assert_eq!(
            parse("LOSS:12,0.004500"),
            ProgressSample::Loss(LossSample::new(12, 0.0045))
        );
    }

    #[test]
    fn compact_weights_marker_accepts_negative_weights() {
        assert_eq!(
            parse("WEIGHTS:3,0.165432,-0.254321"),
            ProgressSample::Weights(WeightSample {
                epoch: 3,
                w1: 0.165432,
                w2: -0.254321,
            })
        );
    }

    #[test]
    fn markers_are_found_anywhere_in_the_line() {
        assert_eq!(
            parse("[stock_net] LOSS:7,0.25 (val 0.3)"),
            ProgressSample::Loss(LossSample::new(7, 0.25))
        );
    }

    #[test]
    fn scientific_notation_is_accepted() {
        assert_eq!(
            parse("LOSS:900,1.5e-05"),
            ProgressSample::Loss(LossSample::new(900, 1.5e-5))
        );
    }

    #[test]
    fn legacy_epoch_line_carries_total() {
        let parsed = parse("Epoch 5/100, Loss: 0.0123");
        let ProgressSample::Loss(sample) = parsed else {
            panic!("expected loss sample, got {parsed:?}");
        };
        assert_eq!(sample.epoch, 5);
        assert_eq!(sample.loss, 0.0123);
        assert_eq!(sample.total_epochs, Some(100));
        assert_eq!(sample.progress_percent(), Some(5.0));
    }

    #[test]
    fn legacy_lowercase_line() {
        assert_eq!(
            parse("epoch 42 loss: 0.5"),
            ProgressSample::Loss(LossSample::new(42, 0.5))
        );
    }

    #[test]
    fn compact_marker_takes_priority_over_legacy() {
        assert_eq!(
            parse("Epoch 1/10, Loss: 9.0 LOSS:1,0.5"),
            ProgressSample::Loss(LossSample::new(1, 0.5))
        );
    }

    #[test]
    fn malformed_numbers_are_unrecognized() {
        for line in [
            "LOSS:3,1.2.3",
            "WEIGHTS:1,0.5,-",
            "WEIGHTS:1,--0.5,0.2",
            "Epoch 2/10, Loss: ..",
            "LOSS:99999999999999999999999,0.1",
        ] {
            assert_eq!(parse(line), ProgressSample::Unrecognized, "{line}");
        }
    }

    #[test]
    fn unrelated_lines_are_unrecognized() {
        for line in [
            "",
            "noise",
            "Loading data...",
            "Epoch 10, Train MSE: 0.076543, Val MSE: 0.089012",
            "LOSS:",
            "LOSS:abc,0.1",
            "LOSS:1;0.1",
            "WEIGHTS:1,0.5",
            "Training complete!",
        ] {
            assert_eq!(parse(line), ProgressSample::Unrecognized, "{line:?}");
        }
    }

    #[test]
    fn unrecognized_never_becomes_a_sample() {
        assert!(ProgressSample::Unrecognized.into_sample().is_none());
        assert_eq!(
            parse("LOSS:0,1.0").into_sample(),
            Some(Sample::Loss(LossSample::new(0, 1.0)))
        );
    }
}
