//! Small numeric helpers shared by segmentation, ROI extraction and QC.
//!
//! All accumulation happens in `f64`, regardless of the `f32` voxel type.

/// Arithmetic mean, `None` for an empty slice.
#[must_use]
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    #[allow(clippy::cast_precision_loss)]
    let n = values.len() as f64;
    Some(values.iter().sum::<f64>() / n)
}

/// Population standard deviation (divides by `n`), `None` for an empty slice.
#[must_use]
pub fn std_dev(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    #[allow(clippy::cast_precision_loss)]
    let n = values.len() as f64;
    let var = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / n;
    Some(var.sqrt())
}

/// Median, averaging the two middle values for even lengths.
#[must_use]
pub fn median(values: &[f64]) -> Option<f64> {
    percentile(values, 50.0)
}

/// Percentile with linear interpolation between closest ranks.
///
/// `q` is in percent (`0..=100`). Matches the default method of
/// `numpy.percentile`: the rank is `q/100 * (n - 1)` and the result is
/// interpolated between the two neighbouring order statistics.
#[must_use]
pub fn percentile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    #[allow(clippy::cast_precision_loss)]
    let rank = (q.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let lo = rank.floor() as usize;
    let hi = (lo + 1).min(sorted.len() - 1);
    #[allow(clippy::cast_precision_loss)]
    let frac = rank - lo as f64;
    Some((sorted[hi] - sorted[lo]).mul_add(frac, sorted[lo]))
}

/// Number of histogram bins per axis used by [`mutual_information`].
pub const MI_BINS: usize = 32;

/// Mutual information (nats) between two equally sized intensity samples.
///
/// Intensities are binned into a [`MI_BINS`]² joint histogram spanning
/// each sample's own range. Returns `None` when the samples differ in
/// length or are empty.
#[must_use]
pub fn mutual_information(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.is_empty() || a.len() != b.len() {
        return None;
    }

    let bin_a = binner(a);
    let bin_b = binner(b);

    let mut joint = vec![0_u64; MI_BINS * MI_BINS];
    let mut marg_a = [0_u64; MI_BINS];
    let mut marg_b = [0_u64; MI_BINS];
    for (&x, &y) in a.iter().zip(b) {
        let i = bin_a(x);
        let j = bin_b(y);
        joint[i * MI_BINS + j] += 1;
        marg_a[i] += 1;
        marg_b[j] += 1;
    }

    #[allow(clippy::cast_precision_loss)]
    let n = a.len() as f64;
    let mut mi = 0.0;
    for i in 0..MI_BINS {
        for j in 0..MI_BINS {
            let c = joint[i * MI_BINS + j];
            if c == 0 {
                continue;
            }
            #[allow(clippy::cast_precision_loss)]
            let (pxy, px, py) = (c as f64 / n, marg_a[i] as f64 / n, marg_b[j] as f64 / n);
            mi += pxy * (pxy / (px * py)).ln();
        }
    }
    Some(mi)
}

/// Map an intensity to its histogram bin over the sample's range.
fn binner(values: &[f32]) -> impl Fn(f32) -> usize {
    let (lo, hi) = values
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let width = f64::from(hi - lo);
    move |v| {
        if width <= 0.0 {
            return 0;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let bin = (f64::from(v - lo) / width * MI_BINS as f64) as usize;
        bin.min(MI_BINS - 1)
    }
}
