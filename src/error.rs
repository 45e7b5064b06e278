// src/error.rs
// ERROR TAXONOMY
// Typed kinds for the failures callers branch on; everything travels through
// anyhow with context attached at component boundaries (complex name, tube
// name, node path). Mutation failure is NOT an error: the mutator returns
// None and the optimizer's counters absorb it.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum DesignError {
    /// The fully-constrained initialization problem admits no assignment.
    ConstraintUnsatisfiable(String),
    /// A mutation attempt exhausted its retries. Recoverable: the optimizer
    /// absorbs these through its counters, so this kind only reaches
    /// callers driving the mutator directly.
    MutationFailed(Vec<usize>),
    /// A structure string failed to parse or validate.
    InvalidStructure(String),
    /// The specification references something that does not exist
    /// (e.g. a tube naming a missing complex).
    InvalidConfiguration(String),
    /// The thermodynamic engine produced NaN; fatal, with the evaluation
    /// context attached for diagnosis.
    ThermoNan {
        sequence: String,
        depth: u32,
        enforced_pairs: Vec<(usize, usize)>,
    },
    /// -inf/NaN reached a numeric interface that forbids it.
    NumericDomain(String),
    /// The cancellation token was set.
    Canceled,
    /// Wall-clock budget exceeded.
    Timeout,
}

impl fmt::Display for DesignError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DesignError::ConstraintUnsatisfiable(what) => {
                write!(f, "no sequence satisfies all constraints: {}", what)
            }
            DesignError::MutationFailed(positions) => {
                write!(f, "mutation of {} position(s) failed", positions.len())
            }
            DesignError::InvalidStructure(what) => write!(f, "invalid structure: {}", what),
            DesignError::InvalidConfiguration(what) => {
                write!(f, "invalid configuration: {}", what)
            }
            DesignError::ThermoNan {
                sequence,
                depth,
                enforced_pairs,
            } => write!(
                f,
                "thermodynamic evaluation produced NaN (sequence {}, depth {}, {} enforced pairs)",
                sequence,
                depth,
                enforced_pairs.len()
            ),
            DesignError::NumericDomain(what) => write!(f, "numeric domain error: {}", what),
            DesignError::Canceled => write!(f, "design canceled"),
            DesignError::Timeout => write!(f, "design timed out"),
        }
    }
}

impl std::error::Error for DesignError {}
