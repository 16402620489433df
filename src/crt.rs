use crate::correlate::{ModulusPeaks, Peak};
use crate::errors::Error;
use num_bigint::BigUint;
use num_traits::{One, ToPrimitive, Zero};
use std::fmt;

/// Hard cap on the number of per-modulus peak combinations the combiner will
/// enumerate; beyond this the peak lists are truncated rank by rank.
const MAX_COMBINATIONS: usize = 100_000;

/// A reconstructed base offset. Negative offsets describe images whose
/// pointers reference addresses slightly below the image start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offset {
    pub negative: bool,
    pub magnitude: BigUint,
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.negative {
            write!(f, "-0x{:x}", self.magnitude)
        } else {
            write!(f, "0x{:x}", self.magnitude)
        }
    }
}

/// The winning base offset together with how many of the moduli agreed on it.
#[derive(Debug, Clone)]
pub struct Estimate {
    pub offset: Offset,
    pub agreed: usize,
    pub total: usize,
}

struct Candidate {
    magnitude: BigUint,
    negative: bool,
    in_range: bool,
    agreed: usize,
    score: i64,
}

fn extended_gcd(a: i128, b: i128) -> (i128, i128, i128) {
    if a == 0 {
        return (b, 0, 1);
    }
    let (g, x, y) = extended_gcd(b % a, a);
    (g, y - (b / a) * x, x)
}

/// Modular inverse of `a` modulo `m`, or None if they share a factor.
pub fn mod_inv(a: u64, m: u64) -> Option<u64> {
    let (g, x, _) = extended_gcd(i128::from(a), i128::from(m));
    if g != 1 {
        return None;
    }
    let m = i128::from(m);
    Some(((x % m + m) % m) as u64)
}

/// Solves the simultaneous congruences `B ≡ r (mod n)` for pairwise-coprime
/// moduli, returning the unique solution in `[0, Π n)`.
pub fn crt(parts: &[(u64, u64)]) -> Result<BigUint, Error> {
    if parts.is_empty() {
        return Err(Error::Internal("empty residue system".into()));
    }
    let mut product = BigUint::one();
    for &(_, n) in parts {
        if n == 0 {
            return Err(Error::InvalidModulus(0));
        }
        product *= BigUint::from(n);
    }
    let mut acc = BigUint::zero();
    for &(r, n) in parts {
        let nb = BigUint::from(n);
        let q = &product / &nb;
        let q_mod = (&q % &nb).to_u64().unwrap_or(0);
        let inv = mod_inv(q_mod, n).ok_or(Error::InvalidModulus(n))?;
        acc += q * (BigUint::from(r) * BigUint::from(inv) % &nb);
    }
    Ok(acc % product)
}

/// Reconstructs full-width base candidates from per-modulus peaks and picks
/// the one with the widest cross-modulus agreement.
///
/// The leading moduli whose product already exceeds the address space (plus
/// the negative-offset window) act as anchors: the Cartesian product of their
/// peak lists is solved by CRT into concrete offsets. The remaining moduli
/// never feed the reconstruction, so a candidate only gains their vote when
/// its residue independently shows up among their peaks. Noise peaks in
/// different moduli reconstruct to unrelated offsets and fail that vote,
/// whereas the true base's residues agree everywhere by construction.
pub fn combine(
    per_modulus: &[ModulusPeaks],
    address_space: &BigUint,
    file_len: u64,
) -> Result<Estimate, Error> {
    let total = per_modulus.len();
    if total == 0 {
        return Err(Error::InsufficientRange("no moduli to combine".into()));
    }
    for mp in per_modulus {
        if mp.peaks.is_empty() {
            return Err(Error::InsufficientData(format!(
                "no correlation peaks for modulus {}",
                mp.modulus
            )));
        }
    }

    let reach = address_space.clone() + BigUint::from(file_len);
    let mut anchor_product = BigUint::one();
    let mut anchors = 0;
    while anchors < total && anchor_product <= reach {
        anchor_product *= BigUint::from(per_modulus[anchors].modulus);
        anchors += 1;
    }
    if anchor_product <= reach {
        return Err(Error::InsufficientRange(format!(
            "product of {} moduli does not cover the address space",
            total
        )));
    }

    // Shrink per-list depth until the Cartesian product stays enumerable.
    let mut limit = per_modulus[..anchors]
        .iter()
        .map(|m| m.peaks.len())
        .max()
        .unwrap_or(1);
    while limit > 1 {
        let count = per_modulus[..anchors]
            .iter()
            .fold(1usize, |acc, m| acc.saturating_mul(m.peaks.len().min(limit)));
        if count <= MAX_COMBINATIONS {
            break;
        }
        limit -= 1;
    }
    let lists: Vec<&[Peak]> = per_modulus[..anchors]
        .iter()
        .map(|m| &m.peaks[..m.peaks.len().min(limit)])
        .collect();

    let mut candidates = Vec::new();
    let mut cursor = vec![0usize; anchors];
    'combos: loop {
        let parts: Vec<(u64, u64)> = cursor
            .iter()
            .enumerate()
            .map(|(i, &c)| (lists[i][c].shift, per_modulus[i].modulus))
            .collect();
        let b = crt(&parts)?;
        candidates.push(score_candidate(
            b,
            &anchor_product,
            address_space,
            file_len,
            per_modulus,
        ));

        let mut pos = anchors;
        while pos > 0 {
            pos -= 1;
            cursor[pos] += 1;
            if cursor[pos] < lists[pos].len() {
                continue 'combos;
            }
            cursor[pos] = 0;
        }
        break;
    }

    // Correlation mass outranks the sign: a cross-pair echo (string A matched
    // against string B's pointer) can tie a real negative base on agreement,
    // but never on summed score.
    candidates.sort_by(|x, y| {
        y.agreed
            .cmp(&x.agreed)
            .then(y.in_range.cmp(&x.in_range))
            .then(y.score.cmp(&x.score))
            .then(x.negative.cmp(&y.negative))
            .then(x.magnitude.cmp(&y.magnitude))
    });
    let best = &candidates[0];

    let validators = total - anchors;
    let required = (anchors + (validators + 1) / 2).max(total / 2 + 1);
    let offset = Offset {
        negative: best.negative,
        magnitude: best.magnitude.clone(),
    };
    if best.in_range && best.agreed >= required {
        Ok(Estimate {
            offset,
            agreed: best.agreed,
            total,
        })
    } else {
        Err(Error::Ambiguous {
            best: offset,
            agreed: best.agreed,
            total,
        })
    }
}

fn score_candidate(
    b: BigUint,
    anchor_product: &BigUint,
    address_space: &BigUint,
    file_len: u64,
    per_modulus: &[ModulusPeaks],
) -> Candidate {
    let (negative, in_range, magnitude) = if &b < address_space {
        (false, true, b)
    } else {
        let d = anchor_product - &b;
        if d <= BigUint::from(file_len) {
            (true, true, d)
        } else {
            (false, false, b)
        }
    };

    // Residues of the candidate as a signed offset: every modulus sees
    // (-d) mod n for a negative candidate, magnitude mod n otherwise.
    let mut agreed = 0;
    let mut score = 0i64;
    for mp in per_modulus {
        let n = mp.modulus;
        let m = (&magnitude % BigUint::from(n)).to_u64().unwrap_or(0);
        let expected = if negative { (n - m) % n } else { m };
        if let Some(p) = mp.peaks.iter().find(|p| p.shift == expected) {
            agreed += 1;
            score += p.score;
        }
    }
    Candidate {
        magnitude,
        negative,
        in_range,
        agreed,
        score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moduli::select_moduli;
    use num_bigint::BigUint;
    use num_traits::One;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn mod_inv_basics() {
        assert_eq!(mod_inv(3, 7), Some(5));
        assert_eq!(mod_inv(2, 691), Some(346));
        assert_eq!(mod_inv(0, 7), None);
        assert_eq!(mod_inv(6, 9), None);
    }

    #[test]
    fn crt_round_trips() {
        let moduli = [1009u64, 1013, 1019, 1021];
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let b: u64 = rng.gen_range(0..1_000_000_000_000);
            let parts: Vec<(u64, u64)> = moduli.iter().map(|&n| (b % n, n)).collect();
            assert_eq!(crt(&parts).unwrap(), BigUint::from(b));
        }
    }

    fn peaks_for(base: u64, moduli: &[u64], score: i64) -> Vec<ModulusPeaks> {
        moduli
            .iter()
            .map(|&n| ModulusPeaks {
                modulus: n,
                peaks: vec![Peak {
                    shift: base % n,
                    score,
                }],
            })
            .collect()
    }

    #[test]
    fn combine_recovers_base_with_full_agreement() {
        let address_space = BigUint::one() << 16;
        let reach = &address_space + BigUint::from(256u64);
        let moduli = select_moduli(300, &reach, 3).unwrap();
        let per = peaks_for(0xBEEF, &moduli, 5);
        let est = combine(&per, &address_space, 256).unwrap();
        assert!(!est.offset.negative);
        assert_eq!(est.offset.magnitude, BigUint::from(0xBEEFu64));
        assert_eq!(est.agreed, est.total);
    }

    #[test]
    fn combine_survives_a_noise_dominated_modulus() {
        let address_space = BigUint::one() << 16;
        let reach = &address_space + BigUint::from(256u64);
        let moduli = select_moduli(300, &reach, 3).unwrap();
        let mut per = peaks_for(0xBEEF, &moduli, 5);
        // One anchor's top peak is noise; the true residue drops to rank two.
        let true_shift = per[1].peaks[0].shift;
        per[1].peaks = vec![
            Peak {
                shift: (true_shift + 17) % moduli[1],
                score: 9,
            },
            Peak {
                shift: true_shift,
                score: 5,
            },
        ];
        let est = combine(&per, &address_space, 256).unwrap();
        assert_eq!(est.offset.magnitude, BigUint::from(0xBEEFu64));
        assert!(!est.offset.negative);
        assert_eq!(est.agreed, est.total);
    }

    #[test]
    fn combine_reports_negative_offsets() {
        let address_space = BigUint::one() << 16;
        let reach = &address_space + BigUint::from(256u64);
        let moduli = select_moduli(300, &reach, 3).unwrap();
        // Residues of the offset -0x40 in every modulus.
        let per: Vec<ModulusPeaks> = moduli
            .iter()
            .map(|&n| ModulusPeaks {
                modulus: n,
                peaks: vec![Peak {
                    shift: n - 0x40,
                    score: 4,
                }],
            })
            .collect();
        let est = combine(&per, &address_space, 256).unwrap();
        assert!(est.offset.negative);
        assert_eq!(est.offset.magnitude, BigUint::from(0x40u64));
        assert_eq!(est.agreed, est.total);
    }

    #[test]
    fn higher_scoring_negative_beats_a_tied_positive() {
        let address_space = BigUint::one() << 16;
        let reach = &address_space + BigUint::from(256u64);
        let moduli = select_moduli(300, &reach, 3).unwrap();
        // A cross-pair echo shows up as a consistent positive offset in every
        // modulus, tying the real negative base on agreement. It carries half
        // the correlation mass, so the summed score must decide.
        let per: Vec<ModulusPeaks> = moduli
            .iter()
            .map(|&n| ModulusPeaks {
                modulus: n,
                peaks: vec![
                    Peak {
                        shift: n - 0x40,
                        score: 4,
                    },
                    Peak {
                        shift: 0xc0,
                        score: 2,
                    },
                ],
            })
            .collect();
        let est = combine(&per, &address_space, 256).unwrap();
        assert!(est.offset.negative);
        assert_eq!(est.offset.magnitude, BigUint::from(0x40u64));
        assert_eq!(est.agreed, est.total);
    }

    #[test]
    fn unrelated_residues_are_ambiguous() {
        let address_space = BigUint::one() << 16;
        let reach = &address_space + BigUint::from(256u64);
        let moduli = select_moduli(300, &reach, 3).unwrap();
        let per: Vec<ModulusPeaks> = moduli
            .iter()
            .enumerate()
            .map(|(i, &n)| ModulusPeaks {
                modulus: n,
                peaks: vec![Peak {
                    shift: (100 * (i as u64 + 1)) % n,
                    score: 2,
                }],
            })
            .collect();
        match combine(&per, &address_space, 256) {
            Err(Error::Ambiguous { total, .. }) => assert_eq!(total, moduli.len()),
            other => panic!("expected ambiguity, got {:?}", other.map(|e| e.offset)),
        }
    }
}
