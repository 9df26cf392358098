/// Observer for compression activity, injected through
/// [`CompressionLayer::observer`](crate::CompressionLayer::observer).
///
/// The middleware itself keeps no counters; hosts that want metrics
/// implement this trait and feed the byte counts into whatever metrics
/// system they use. All methods have no-op defaults so implementors only
/// override what they care about.
pub trait CompressionObserver: Send + Sync {
    /// A response body finished compressing.
    ///
    /// `bytes_in` is the uncompressed byte count the handler produced,
    /// `bytes_out` the gzip byte count sent to the client.
    fn on_response_compressed(&self, bytes_in: u64, bytes_out: u64) {
        let _ = (bytes_in, bytes_out);
    }

    /// A response was forwarded without compression.
    fn on_response_passthrough(&self) {}

    /// A request body finished decompressing.
    ///
    /// `bytes_in` is the gzip byte count received on the wire, `bytes_out`
    /// the decoded byte count handed to the inner service.
    fn on_request_decompressed(&self, bytes_in: u64, bytes_out: u64) {
        let _ = (bytes_in, bytes_out);
    }
}
