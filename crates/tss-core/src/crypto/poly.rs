//! Secret polynomials, Feldman commitments and Lagrange weights

use super::public_point;
use crate::{Error, MemberId, Result};
use k256::{elliptic_curve::Field, ProjectivePoint, Scalar};
use rand_core::CryptoRngCore;
use std::collections::BTreeSet;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Secret polynomial of degree t-1; coefficient 0 is the member's secret.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Polynomial {
    coefficients: Vec<Scalar>,
}

impl Polynomial {
    /// Random polynomial with `threshold` coefficients
    pub fn random<R: CryptoRngCore>(threshold: usize, rng: &mut R) -> Self {
        let coefficients = (0..threshold).map(|_| Scalar::random(&mut *rng)).collect();
        Self { coefficients }
    }

    pub fn from_coefficients(coefficients: Vec<Scalar>) -> Self {
        Self { coefficients }
    }

    pub fn coefficients(&self) -> &[Scalar] {
        &self.coefficients
    }

    /// Constant term
    pub fn secret(&self) -> Scalar {
        self.coefficients.first().copied().unwrap_or(Scalar::ZERO)
    }

    /// Evaluate at `x` (Horner)
    pub fn evaluate(&self, x: &Scalar) -> Scalar {
        self.coefficients
            .iter()
            .rev()
            .fold(Scalar::ZERO, |acc, coef| acc * x + coef)
    }

    /// Feldman commitments `a_k·G`
    pub fn commitments(&self) -> Vec<ProjectivePoint> {
        self.coefficients.iter().map(public_point).collect()
    }
}

/// Evaluate committed polynomial at `x`: `Σ_k A_k·x^k`.
pub fn evaluate_commitments(commitments: &[ProjectivePoint], x: &Scalar) -> ProjectivePoint {
    commitments
        .iter()
        .rev()
        .fold(ProjectivePoint::IDENTITY, |acc, commit| acc * x + commit)
}

/// Lagrange coefficient at zero for `member` over `members`.
///
/// `λ_i = Π_{j≠i} j / (j - i)`
pub fn lagrange_coefficient(member: MemberId, members: &[MemberId]) -> Result<Scalar> {
    let unique: BTreeSet<MemberId> = members.iter().copied().collect();
    if unique.len() != members.len() {
        return Err(Error::InvalidConfig("Duplicate member in signer set".into()));
    }
    if !unique.contains(&member) {
        return Err(Error::NotFound(format!("member {} in signer set", member)));
    }

    let i = member.scalar();
    let mut numerator = Scalar::ONE;
    let mut denominator = Scalar::ONE;
    for &other in members.iter().filter(|&&m| m != member) {
        let j = other.scalar();
        numerator *= j;
        denominator *= j - i;
    }

    let inverse: Option<Scalar> = denominator.invert().into();
    inverse
        .map(|inv| numerator * inv)
        .ok_or_else(|| Error::Internal("Lagrange denominator is zero".into()))
}
