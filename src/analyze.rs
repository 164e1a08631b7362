//! Builds column and index statistics from analyzed values.

use crate::types::{Bucket, ColumnStats, Datum, HistKey, Histogram, Timestamp};

/// Values of one column or index, in row insertion order.
#[derive(Debug, Clone)]
pub struct AnalyzeInput {
    pub key: HistKey,
    pub values: Vec<Datum>,
}

/// Equi-depth histogram over the non-null `values`.
///
/// Equal values never straddle two buckets: a bucket whose upper bound
/// repeats keeps growing past its target depth.
pub fn build_histogram(values: &[Datum], num_buckets: usize) -> Histogram {
    let null_count = values.iter().filter(|v| v.is_null()).count() as i64;
    let mut sorted: Vec<&Datum> = values.iter().filter(|v| !v.is_null()).collect();
    sorted.sort();

    let mut hist = Histogram {
        buckets: Vec::new(),
        null_count,
        ndv: 0,
    };
    if sorted.is_empty() {
        return hist;
    }

    let depth = sorted.len().div_ceil(num_buckets.max(1)) as i64;
    let mut bucket_start = 0i64;
    let mut total = 0i64;
    for value in sorted {
        total += 1;
        match hist.buckets.last_mut() {
            Some(last) if last.upper == *value => {
                last.count = total;
                last.repeats += 1;
            }
            Some(last) if last.count - bucket_start < depth => {
                hist.ndv += 1;
                last.upper = value.clone();
                last.count = total;
                last.repeats = 1;
            }
            prev => {
                hist.ndv += 1;
                bucket_start = prev.map(|b| b.count).unwrap_or(0);
                hist.buckets.push(Bucket {
                    lower: value.clone(),
                    upper: value.clone(),
                    count: total,
                    repeats: 1,
                });
            }
        }
    }
    hist
}

/// Correlation between insertion order and value order of the non-null
/// `values`, in [-1, 1]. 1 means the values were inserted already sorted.
pub fn correlation(values: &[Datum]) -> f64 {
    let mut ordered: Vec<(usize, &Datum)> =
        values.iter().filter(|v| !v.is_null()).enumerate().collect();
    let n = ordered.len();
    if n == 0 {
        return 0.0;
    }
    if n == 1 {
        return 1.0;
    }
    // Stable sort keeps ties in insertion order.
    ordered.sort_by(|a, b| a.1.cmp(b.1));

    let xy_sum: f64 = ordered
        .iter()
        .enumerate()
        .map(|(rank, (ordinal, _))| rank as f64 * *ordinal as f64)
        .sum();
    let items = n as f64;
    let x_sum = (items - 1.0) * items / 2.0;
    let x2_sum = (items - 1.0) * items * (2.0 * items - 1.0) / 6.0;
    let corr = (items * xy_sum - x_sum * x_sum) / (items * x2_sum - x_sum * x_sum);
    corr.clamp(-1.0, 1.0)
}

pub fn build_column_stats(input: &AnalyzeInput, num_buckets: usize) -> ColumnStats {
    ColumnStats {
        key: input.key,
        histogram: build_histogram(&input.values, num_buckets),
        correlation: correlation(&input.values),
        last_update_version: Timestamp::ZERO,
    }
}
