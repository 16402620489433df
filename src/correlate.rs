use crate::errors::Error;
use crate::noise::NoiseModel;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

/// Largest acceptable deviation of a correlation bin from the nearest
/// integer after the inverse transform. Anything above this means the
/// floating-point path lost too much precision to trust the counts.
pub const CORR_TOLERANCE: f64 = 0.25;

/// How many ranked shifts are kept per modulus for the combiner.
pub const TOP_PEAKS: usize = 3;

/// Shifts tied at the maximum score are all retained, but never more than
/// this many.
const TIE_CAP: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peak {
    pub shift: u64,
    pub score: i64,
}

/// Ranked correlation peaks for a single modulus.
#[derive(Debug, Clone)]
pub struct ModulusPeaks {
    pub modulus: u64,
    pub peaks: Vec<Peak>,
}

/// Circular cross-correlation of two equal-length count vectors:
/// `corr[r] = sum_i x[i] * y[(i + r) mod n]`.
///
/// Computed as `ifft(conj(fft(x)) * fft(y)) / n`, which counts, for every
/// hypothesized shift r, how many (string, pointer) pairs coincide modulo n.
/// The direct sum would be O(n^2) with n at least the file length, so only
/// the transform route is viable.
pub fn cross_correlate(x: &[u32], y: &[u32]) -> Result<Vec<i64>, Error> {
    let n = x.len();
    if n == 0 {
        return Err(Error::InvalidModulus(0));
    }
    if n != y.len() {
        return Err(Error::Internal(format!(
            "residue vector length mismatch: {} vs {}",
            n,
            y.len()
        )));
    }

    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(n);
    let ifft = planner.plan_fft_inverse(n);

    let mut fx: Vec<Complex<f64>> = x.iter().map(|&c| Complex::new(f64::from(c), 0.0)).collect();
    let mut fy: Vec<Complex<f64>> = y.iter().map(|&c| Complex::new(f64::from(c), 0.0)).collect();
    fft.process(&mut fx);
    fft.process(&mut fy);
    // rustfft's inverse is unnormalized, so fold the 1/n in here.
    for (a, b) in fx.iter_mut().zip(fy.iter()) {
        *a = a.conj() * b / n as f64;
    }
    ifft.process(&mut fx);

    let mut out = Vec::with_capacity(n);
    let mut residual = 0.0f64;
    for c in fx {
        let rounded = c.re.round();
        residual = residual.max((c.re - rounded).abs()).max(c.im.abs());
        out.push(rounded as i64);
    }
    if residual > CORR_TOLERANCE {
        return Err(Error::Numerics {
            modulus: n as u64,
            residual,
        });
    }
    Ok(out)
}

/// Extracts the ranked peaks of a correlation: every shift tied at the
/// maximum score (smallest shifts first, capped), then the next-best shifts
/// until `k` in total. Peaks the noise model deems insignificant are dropped,
/// except that the single best peak always survives as a best-effort
/// candidate.
pub fn top_peaks(corr: &[i64], k: usize, model: &NoiseModel) -> Vec<Peak> {
    let cap = TIE_CAP.max(k);
    let mut best: Vec<Peak> = Vec::with_capacity(cap + 1);
    for (shift, &score) in corr.iter().enumerate() {
        if score <= 0 {
            continue;
        }
        let cand = Peak {
            shift: shift as u64,
            score,
        };
        // Iteration order is ascending shifts, so a strict comparison keeps
        // the smallest shift among equal scores.
        if best.len() < cap {
            best.push(cand);
        } else if cand.score > best[cap - 1].score {
            best[cap - 1] = cand;
        } else {
            continue;
        }
        best.sort_by(|a, b| b.score.cmp(&a.score).then(a.shift.cmp(&b.shift)));
    }
    if best.is_empty() {
        return best;
    }

    let top_score = best[0].score;
    let mut retained: Vec<Peak> = Vec::new();
    for p in best {
        if p.score == top_score || retained.len() < k {
            retained.push(p);
        }
    }

    let significant: Vec<Peak> = retained
        .iter()
        .copied()
        .filter(|p| model.is_significant(p.score))
        .collect();
    if significant.is_empty() {
        retained.truncate(1);
        retained
    } else {
        significant
    }
}
