//! SU(2) angular-momentum helpers for spin adaptation.
//!
//! All spin quantum numbers are carried in doubled form so that half-integral values stay in
//! integer arithmetic: a spin $`S`$ is stored as `twice_s = 2S` and a projection $`M`$ as
//! `twice_m = 2M`.

use factorial::Factorial;
use itertools::Itertools;


/// Doubled spin of a single fermion.
pub const TWICE_SPIN_HALF: u32 = 1;

/// Returns the multiplicity $`2S + 1`$ of a doubled spin.
pub fn multiplicity(twice_s: u32) -> u32 {
    twice_s + 1
}

/// Returns the doubled spin $`2S`$ of a multiplicity $`2S + 1`$.
///
/// # Panics
///
/// Panics if `mult` is zero, which is not a valid multiplicity.
pub fn twice_spin_from_mult(mult: u32) -> u32 {
    assert!(mult > 0, "A spin multiplicity must be positive.");
    mult - 1
}

/// Returns the doubled projections $`2M`$ of a doubled spin, in ascending order
/// $`-S, -S + 1, \ldots, S`$.
pub fn twice_projections(twice_s: u32) -> impl Iterator<Item = i32> + Clone {
    let twice_s = twice_s as i32;
    (-twice_s..=twice_s).step_by(2)
}

/// Returns the allowed doubled total spins when coupling two doubled spins, in ascending order.
///
/// # Arguments
///
/// * `twice_a` - The first doubled spin.
/// * `twice_b` - The second doubled spin.
///
/// # Returns
///
/// The doubled total spins $`|a - b|, |a - b| + 1, \ldots, a + b`$.
pub fn coupled_spins(twice_a: u32, twice_b: u32) -> Vec<u32> {
    let lo = twice_a.abs_diff(twice_b);
    let hi = twice_a + twice_b;
    (lo..=hi).step_by(2).collect_vec()
}

/// Formats a doubled spin as a spin label such as `0`, `1/2` or `3/2`.
pub fn spin_label(twice_s: u32) -> String {
    if twice_s % 2 == 0 {
        format!("{}", twice_s / 2)
    } else {
        format!("{twice_s}/2")
    }
}

/// Returns $`n!`$ for a doubled argument `twice_n = 2n`, or `None` if `twice_n` is negative or odd.
fn half_factorial(twice_n: i32) -> Option<f64> {
    if twice_n < 0 || twice_n % 2 != 0 {
        return None;
    }
    let n = u64::try_from(twice_n / 2).ok()?;
    n.checked_factorial().map(|value| value as f64)
}

/// Calculates the Clebsch--Gordan coefficient $`\langle j_1 m_1; j_2 m_2 | j m \rangle`$ using
/// Racah's formula.
///
/// # Arguments
///
/// * `twice_j1` - Doubled spin $`2j_1`$.
/// * `twice_m1` - Doubled projection $`2m_1`$.
/// * `twice_j2` - Doubled spin $`2j_2`$.
/// * `twice_m2` - Doubled projection $`2m_2`$.
/// * `twice_j` - Doubled coupled spin $`2j`$.
/// * `twice_m` - Doubled coupled projection $`2m`$.
///
/// # Returns
///
/// The Clebsch--Gordan coefficient in the Condon--Shortley phase convention. Coefficients that
/// vanish by selection rules are returned as exact zeros.
pub fn clebsch_gordan(
    twice_j1: u32,
    twice_m1: i32,
    twice_j2: u32,
    twice_m2: i32,
    twice_j: u32,
    twice_m: i32,
) -> f64 {
    let (j1, j2, j) = (twice_j1 as i32, twice_j2 as i32, twice_j as i32);
    let (m1, m2, m) = (twice_m1, twice_m2, twice_m);

    if m1 + m2 != m || m1.abs() > j1 || m2.abs() > j2 || m.abs() > j {
        return 0.0;
    }
    if (j1 + m1) % 2 != 0 || (j2 + m2) % 2 != 0 || (j + m) % 2 != 0 {
        return 0.0;
    }
    if j < (j1 - j2).abs() || j > j1 + j2 || (j1 + j2 + j) % 2 != 0 {
        return 0.0;
    }

    // Every argument below is even and non-negative once the selection rules above hold.
    let f = |twice_n: i32| half_factorial(twice_n).unwrap_or(f64::NAN);

    let prefactor = ((j + 1) as f64 * f(j + j1 - j2) * f(j - j1 + j2) * f(j1 + j2 - j)
        / f(j1 + j2 + j + 2))
    .sqrt();
    let projection_factor =
        (f(j + m) * f(j - m) * f(j1 - m1) * f(j1 + m1) * f(j2 - m2) * f(j2 + m2)).sqrt();

    let sum = (0..=(j1 + j2 + j))
        .step_by(2)
        .filter_map(|twice_k| {
            let denominators = [
                twice_k,
                j1 + j2 - j - twice_k,
                j1 - m1 - twice_k,
                j2 + m2 - twice_k,
                j - j2 + m1 + twice_k,
                j - j1 - m2 + twice_k,
            ];
            if denominators.iter().any(|&d| d < 0) {
                None
            } else {
                let sign = if (twice_k / 2) % 2 == 0 { 1.0 } else { -1.0 };
                Some(sign / denominators.iter().map(|&d| f(d)).product::<f64>())
            }
        })
        .sum::<f64>();

    prefactor * projection_factor * sum
}
