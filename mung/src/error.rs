use thiserror::Error;

/// Failures of the integration and clustering stages.
///
/// Operations return `anyhow::Result`; recover the kind with
/// `err.downcast_ref::<MungError>()` or [`MungError::of`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MungError {
    /// Incompatible feature spaces or mismatched lengths
    #[error("dimension mismatch in {context}: expected {expected}, found {found}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        found: usize,
    },

    /// The data support fewer components than requested
    #[error("degenerate input: requested rank {requested}, achievable {achievable}")]
    DegenerateInput { requested: usize, achievable: usize },

    #[error("insufficient points: {points} point(s) for k = {k}")]
    InsufficientPoints { points: usize, k: usize },

    #[error("empty graph")]
    EmptyGraph,

    #[error("no anchors found between '{batch_a}' and '{batch_b}'")]
    NoAnchorsFound { batch_a: String, batch_b: String },

    /// A stop request was observed; not a failure of the input
    #[error("cancelled")]
    Cancelled,

    /// Embeddings come from different projections
    #[error("embeddings from different bases: {left} vs {right}")]
    BasisMismatch { left: String, right: String },

    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
}

impl MungError {
    pub fn of(err: &anyhow::Error) -> Option<&MungError> {
        err.downcast_ref::<MungError>()
    }

    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> anyhow::Error {
        MungError::InvalidParameter {
            name,
            reason: reason.into(),
        }
        .into()
    }

    pub(crate) fn mismatch(context: impl Into<String>, expected: usize, found: usize) -> anyhow::Error {
        MungError::DimensionMismatch {
            context: context.into(),
            expected,
            found,
        }
        .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recover_kind_from_anyhow() {
        let err: anyhow::Error = MungError::EmptyGraph.into();
        assert_eq!(MungError::of(&err), Some(&MungError::EmptyGraph));

        let err = MungError::invalid("k", "must be positive");
        assert!(matches!(
            MungError::of(&err),
            Some(MungError::InvalidParameter { name: "k", .. })
        ));

        let other = anyhow::anyhow!("io");
        assert!(MungError::of(&other).is_none());
    }
}
