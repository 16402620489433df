use crate::errors::Error;
use num_bigint::BigUint;
use num_integer::Integer;
use num_traits::ToPrimitive;

/// Moduli selected beyond the ones needed to cover the address space. Their
/// peaks take no part in reconstruction and exist purely to confirm or deny
/// a candidate.
pub const EXTRA_MODULI: usize = 4;

/// Defensive ceiling; hitting it means the input parameters are absurd.
const MAX_MODULI: usize = 256;

/// Produces strictly increasing pairwise-coprime moduli, each greater than
/// `min`, until their product exceeds `reach`, then `extra` more for
/// cross-validation.
///
/// Only odd candidates are considered: unaligned pointer scans produce many
/// values differing by multiples of 256, and a modulus sharing factors with
/// 256 folds those onto each other and corrupts the correlation.
pub fn select_moduli(min: u64, reach: &BigUint, extra: usize) -> Result<Vec<u64>, Error> {
    if min == 0 {
        return Err(Error::InvalidModulus(0));
    }
    // First odd integer strictly above min.
    let mut i = min
        .checked_add(1 + min % 2)
        .ok_or_else(|| Error::InsufficientRange("modulus candidate overflow".into()))?;
    let mut moduli = vec![i];
    let mut product = BigUint::from(i);
    let mut extras_left = extra;

    loop {
        if &product > reach {
            if extras_left == 0 {
                break;
            }
            extras_left -= 1;
        }
        loop {
            i = i
                .checked_add(2)
                .ok_or_else(|| Error::InsufficientRange("modulus candidate overflow".into()))?;
            // gcd(i, product) == gcd(i, product mod i)
            let r = (&product % BigUint::from(i)).to_u64().unwrap_or(0);
            if i.gcd(&r) == 1 {
                break;
            }
        }
        moduli.push(i);
        product *= BigUint::from(i);
        if moduli.len() > MAX_MODULI {
            return Err(Error::InsufficientRange(format!(
                "more than {} moduli required",
                MAX_MODULI
            )));
        }
    }
    Ok(moduli)
}
