// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Typed field aggregation for grouped reads
//
// Entries may already be pre-aggregated buckets, so counts compose:
// averages are count-weighted and the resulting count is the sum of the
// group's counts. The count is summed for every function, min/max included.

use serde::{Deserialize, Serialize};

use crate::model::{Entry, FieldValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    Sum,
    Average,
    Min,
    Max,
}

/// Declared value type of an aggregated field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Integer,
    Float,
}

fn as_i64(value: FieldValue) -> i64 {
    match value {
        FieldValue::Integer(v) => v,
        FieldValue::Float(v) => v as i64,
    }
}

/// Aggregates one field of a conflict group
#[derive(Debug, Clone, PartialEq)]
pub enum FieldCalculator {
    IntegerSum(String),
    IntegerAverage(String),
    IntegerMin(String),
    IntegerMax(String),
    FloatSum(String),
    FloatAverage(String),
    FloatMin(String),
    FloatMax(String),
}

impl FieldCalculator {
    pub fn new(name: impl Into<String>, kind: FieldKind, function: AggregateFunction) -> Self {
        let name = name.into();
        match (kind, function) {
            (FieldKind::Integer, AggregateFunction::Sum) => FieldCalculator::IntegerSum(name),
            (FieldKind::Integer, AggregateFunction::Average) => {
                FieldCalculator::IntegerAverage(name)
            }
            (FieldKind::Integer, AggregateFunction::Min) => FieldCalculator::IntegerMin(name),
            (FieldKind::Integer, AggregateFunction::Max) => FieldCalculator::IntegerMax(name),
            (FieldKind::Float, AggregateFunction::Sum) => FieldCalculator::FloatSum(name),
            (FieldKind::Float, AggregateFunction::Average) => FieldCalculator::FloatAverage(name),
            (FieldKind::Float, AggregateFunction::Min) => FieldCalculator::FloatMin(name),
            (FieldKind::Float, AggregateFunction::Max) => FieldCalculator::FloatMax(name),
        }
    }

    pub fn field(&self) -> &str {
        match self {
            FieldCalculator::IntegerSum(name)
            | FieldCalculator::IntegerAverage(name)
            | FieldCalculator::IntegerMin(name)
            | FieldCalculator::IntegerMax(name)
            | FieldCalculator::FloatSum(name)
            | FieldCalculator::FloatAverage(name)
            | FieldCalculator::FloatMin(name)
            | FieldCalculator::FloatMax(name) => name,
        }
    }

    /// Aggregate the field over `group`; `None` when no entry carries it
    pub fn calculate(&self, group: &[Entry]) -> Option<FieldValue> {
        let name = self.field();
        let values: Vec<(FieldValue, u64)> = group
            .iter()
            .filter_map(|e| e.field(name).map(|v| (v, e.count())))
            .collect();
        if values.is_empty() {
            return None;
        }

        let value = match self {
            FieldCalculator::IntegerSum(_) => {
                let sum: i128 = values.iter().map(|(v, _)| as_i64(*v) as i128).sum();
                FieldValue::Integer(clamp_i64(sum))
            }
            FieldCalculator::IntegerAverage(_) => {
                let weighted: i128 = values
                    .iter()
                    .map(|(v, c)| as_i64(*v) as i128 * *c as i128)
                    .sum();
                let counts: i128 = values.iter().map(|(_, c)| *c as i128).sum();
                FieldValue::Integer(clamp_i64(weighted / counts.max(1)))
            }
            FieldCalculator::IntegerMin(_) => {
                FieldValue::Integer(values.iter().map(|(v, _)| as_i64(*v)).min()?)
            }
            FieldCalculator::IntegerMax(_) => {
                FieldValue::Integer(values.iter().map(|(v, _)| as_i64(*v)).max()?)
            }
            FieldCalculator::FloatSum(_) => {
                FieldValue::Float(values.iter().map(|(v, _)| v.as_f64()).sum())
            }
            FieldCalculator::FloatAverage(_) => {
                let weighted: f64 = values.iter().map(|(v, c)| v.as_f64() * *c as f64).sum();
                let counts: f64 = values.iter().map(|(_, c)| *c as f64).sum();
                FieldValue::Float(weighted / counts)
            }
            FieldCalculator::FloatMin(_) => FieldValue::Float(
                values
                    .iter()
                    .map(|(v, _)| v.as_f64())
                    .fold(f64::INFINITY, f64::min),
            ),
            FieldCalculator::FloatMax(_) => FieldValue::Float(
                values
                    .iter()
                    .map(|(v, _)| v.as_f64())
                    .fold(f64::NEG_INFINITY, f64::max),
            ),
        };
        Some(value)
    }
}

fn clamp_i64(value: i128) -> i64 {
    value.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// Aggregation request: one calculator per declared field
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    function: AggregateFunction,
    calculators: Vec<FieldCalculator>,
}

impl Aggregation {
    pub fn new<I, S>(function: AggregateFunction, fields: I) -> Self
    where
        I: IntoIterator<Item = (S, FieldKind)>,
        S: Into<String>,
    {
        let calculators = fields
            .into_iter()
            .map(|(name, kind)| FieldCalculator::new(name, kind, function))
            .collect();
        Self {
            function,
            calculators,
        }
    }

    pub fn function(&self) -> AggregateFunction {
        self.function
    }

    /// Fold a same-timestamp conflict group into one entry
    ///
    /// Fields without a calculator keep the first entry's value.
    pub fn resolve(&self, group: Vec<Entry>) -> Entry {
        let total_count: u64 = group.iter().map(Entry::count).sum();
        let mut results = Vec::with_capacity(self.calculators.len());
        for calculator in &self.calculators {
            if let Some(value) = calculator.calculate(&group) {
                results.push((calculator.field().to_string(), value));
            }
        }

        let mut resolved = group
            .into_iter()
            .next()
            .unwrap_or_else(|| unreachable!("conflict groups are never empty"));
        for (name, value) in results {
            resolved.set_field(name, value);
        }
        resolved.set_count(total_count);
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn entry(value: f64, count: u64) -> Entry {
        let mut entry = Entry::new(Utc.timestamp_opt(0, 0).unwrap()).with_field("value", value);
        entry.set_count(count);
        entry
    }

    #[test]
    fn test_float_average_is_count_weighted() {
        let aggregation = Aggregation::new(AggregateFunction::Average, [("value", FieldKind::Float)]);
        let resolved = aggregation.resolve(vec![entry(10.0, 2), entry(20.0, 3), entry(30.0, 5)]);
        assert_eq!(resolved.count(), 10);
        assert_eq!(resolved.field("value"), Some(FieldValue::Float(23.0)));
    }

    #[test]
    fn test_min_max_still_sum_counts() {
        let min = Aggregation::new(AggregateFunction::Min, [("value", FieldKind::Float)]);
        let resolved = min.resolve(vec![entry(4.0, 1), entry(2.0, 2)]);
        assert_eq!(resolved.field("value"), Some(FieldValue::Float(2.0)));
        assert_eq!(resolved.count(), 3);

        let max = Aggregation::new(AggregateFunction::Max, [("value", FieldKind::Integer)]);
        let resolved = max.resolve(vec![entry(4.0, 1), entry(2.0, 2)]);
        assert_eq!(resolved.field("value"), Some(FieldValue::Integer(4)));
        assert_eq!(resolved.count(), 3);
    }

    #[test]
    fn test_missing_field_is_skipped() {
        let sum = Aggregation::new(AggregateFunction::Sum, [("other", FieldKind::Integer)]);
        let resolved = sum.resolve(vec![entry(1.0, 1), entry(2.0, 1)]);
        assert_eq!(resolved.field("other"), None);
        assert_eq!(resolved.field("value"), Some(FieldValue::Float(1.0)));
        assert_eq!(resolved.count(), 2);
    }
}
