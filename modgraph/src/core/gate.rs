//! Read-only lookup for experimental features.

/// Answers whether experimental operations (`get_lm`/`set_lm`) may run.
pub trait FeatureGate {
    fn experimental_enabled(&self) -> bool;
}

impl FeatureGate for bool {
    fn experimental_enabled(&self) -> bool {
        *self
    }
}
