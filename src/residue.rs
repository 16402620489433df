use crate::errors::Error;
use fnv::FnvHashSet;
use std::convert::TryFrom;

/// Projects a set of integers into count buckets modulo `modulus`: index `i`
/// of the result holds the number of elements congruent to `i`.
pub fn residue_vector(values: &FnvHashSet<u64>, modulus: u64) -> Result<Vec<u32>, Error> {
    if modulus == 0 {
        return Err(Error::InvalidModulus(0));
    }
    let len = usize::try_from(modulus).map_err(|_| Error::InvalidModulus(modulus))?;
    let mut counts = vec![0u32; len];
    for &v in values {
        counts[(v % modulus) as usize] += 1;
    }
    Ok(counts)
}
