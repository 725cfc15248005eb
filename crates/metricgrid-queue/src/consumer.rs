//! Consumer side of a queue.

/// Handler driven by a queue consumer thread.
///
/// Records arrive in channel order. After each contiguous run taken from a
/// channel the thread calls [`Consumer::end_of_batch`], so implementations
/// can buffer per record and flush once per batch.
pub trait Consumer<T>: Send + 'static {
    fn consume(&mut self, item: T) -> anyhow::Result<()>;

    fn end_of_batch(&mut self) {}
}

impl<T, F> Consumer<T> for F
where
    F: FnMut(T) -> anyhow::Result<()> + Send + 'static,
{
    fn consume(&mut self, item: T) -> anyhow::Result<()> {
        self(item)
    }
}
