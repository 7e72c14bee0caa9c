use crate::error::StoreError;
use crate::types::Point;

/// Bounded staging buffer in front of one shard's segment builder.
///
/// Writers append under the shard's buffer lock; the shard worker drains the
/// whole batch at flush time. When the buffer is at capacity the write fails
/// with `Backpressure` and the caller may retry after a drain.
#[derive(Debug)]
pub struct WriteBuffer {
    shard: usize,
    points: Vec<Point>,
    capacity: usize,
}

impl WriteBuffer {
    pub fn new(shard: usize, capacity: usize) -> Self {
        WriteBuffer {
            shard,
            points: Vec::new(),
            capacity,
        }
    }

    /// Stages one point. Returns the buffered count after the append so the
    /// caller can decide whether to nudge the worker.
    pub fn stage(&mut self, point: Point) -> Result<usize, StoreError> {
        if self.points.len() >= self.capacity {
            return Err(StoreError::Backpressure {
                shard: self.shard,
                capacity: self.capacity,
            });
        }
        self.points.push(point);
        Ok(self.points.len())
    }

    /// Takes everything staged so far, in submission order.
    pub fn drain(&mut self) -> Vec<Point> {
        std::mem::take(&mut self.points)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(ts: i64, value: f64) -> Point {
        Point { series_id: 1, timestamp: ts, value }
    }

    #[test]
    fn stage_and_drain_preserve_order() {
        let mut buf = WriteBuffer::new(0, 16);
        buf.stage(point(1, 1.0)).unwrap();
        buf.stage(point(3, 3.0)).unwrap();
        buf.stage(point(2, 2.0)).unwrap();

        let drained = buf.drain();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0].timestamp, 1);
        assert_eq!(drained[1].timestamp, 3);
        assert_eq!(drained[2].timestamp, 2);
        assert!(buf.is_empty());
    }

    #[test]
    fn full_buffer_reports_backpressure() {
        let mut buf = WriteBuffer::new(3, 2);
        buf.stage(point(1, 1.0)).unwrap();
        buf.stage(point(2, 2.0)).unwrap();
        let err = buf.stage(point(3, 3.0)).unwrap_err();
        assert!(matches!(err, StoreError::Backpressure { shard: 3, capacity: 2 }));

        // Draining frees the space again.
        buf.drain();
        buf.stage(point(4, 4.0)).unwrap();
    }

    #[test]
    fn second_drain_is_empty() {
        let mut buf = WriteBuffer::new(0, 4);
        buf.stage(point(1, 1.0)).unwrap();
        assert_eq!(buf.drain().len(), 1);
        assert!(buf.drain().is_empty());
    }
}
