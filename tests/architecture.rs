//! Architecture Verification Suite
//!
//! Keeps the model's moving parts shareable across threads and its public
//! surface wired together.

#[cfg(test)]
mod architecture_tests {
    use arc_compressor::{ArcCompressor, MultiTensor, SignatureRegistry, Task, Trainer};
    use candle_core::Tensor;

    #[test]
    fn test_core_types_are_thread_safe() {
        fn assert_send_sync<T: Send + Sync>() {}

        assert_send_sync::<Task>();
        assert_send_sync::<SignatureRegistry>();
        assert_send_sync::<MultiTensor<Tensor>>();
        assert_send_sync::<ArcCompressor>();
    }

    #[test]
    fn test_trainer_can_move_between_threads() {
        fn assert_send<T: Send>() {}
        assert_send::<Trainer>();
    }
}
