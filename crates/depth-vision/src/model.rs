use anyhow::Result;

use crate::decode::RawOutput;
use crate::letterbox::ScaledImage;

/// Opaque detector: letterboxed frame in, raw candidates out.
pub trait Model {
    fn infer(&mut self, input: &ScaledImage) -> Result<RawOutput>;
}

impl<M: Model + ?Sized> Model for Box<M> {
    fn infer(&mut self, input: &ScaledImage) -> Result<RawOutput> {
        (**self).infer(input)
    }
}
