use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Weight of one element, used for the queue amount accounting.
pub type AmountFunction<T> = Box<dyn Fn(&T) -> usize + Send + Sync>;

struct Inner<T> {
    queue: VecDeque<T>,
    amount: usize,
    stopping: bool,
}

/// Bounded MPSC-style queue with a byte-aware amount function.
///
/// `amount()` always equals the sum of the amount function over the current
/// elements; the default amount function returns 1, making `amount == size`.
/// A stopped queue wakes all waiters permanently: pushes are discarded and
/// pops drain the remaining elements, then return `None`.
pub struct Queue<T> {
    limit: usize,
    amount_function: AmountFunction<T>,
    inner: Mutex<Inner<T>>,
    pop_condition: Condvar,
    push_condition: Condvar,
}

impl<T> Queue<T> {
    /// Creates a queue bounded by `limit` in amount units; 0 means unbounded.
    pub fn new(limit: usize) -> Self {
        Self::with_amount_function(limit, Box::new(|_| 1))
    }

    pub fn with_amount_function(limit: usize, amount_function: AmountFunction<T>) -> Self {
        Self {
            limit,
            amount_function,
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                amount: 0,
                stopping: false,
            }),
            pop_condition: Condvar::new(),
            push_condition: Condvar::new(),
        }
    }

    /// Wakes all waiters permanently.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.stopping = true;
        self.pop_condition.notify_all();
        self.push_condition.notify_all();
    }

    /// The queue is running while it still holds elements or is not stopped.
    pub fn running(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        !inner.queue.is_empty() || !inner.stopping
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        if self.limit == 0 {
            return false;
        }
        self.inner.lock().unwrap().amount >= self.limit
    }

    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn amount(&self) -> usize {
        self.inner.lock().unwrap().amount
    }

    /// Blocks while the element would push the amount over the limit, unless
    /// the queue is stopped.
    pub fn push(&self, element: T) {
        let mut inner = self.inner.lock().unwrap();
        let added = (self.amount_function)(&element);
        while self.limit != 0 && inner.amount + added > self.limit && !inner.stopping {
            inner = self.push_condition.wait(inner).unwrap();
        }
        self.push_locked(&mut inner, element, added);
    }

    /// Blocks until an element is available or the queue is stopped.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        while inner.queue.is_empty() && !inner.stopping {
            inner = self.pop_condition.wait(inner).unwrap();
        }
        self.pop_locked(&mut inner)
    }

    pub fn try_pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        self.pop_locked(&mut inner)
    }

    /// Swaps the head element, leaving the queue size unchanged.
    pub fn exchange(&self, element: T) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        if inner.queue.is_empty() {
            return None;
        }
        let added = (self.amount_function)(&element);
        let head = std::mem::replace(&mut inner.queue[0], element);
        inner.amount += added;
        inner.amount -= (self.amount_function)(&head);
        Some(head)
    }

    /// Waits until the queue is non-empty or stopped. Returns false if the
    /// timeout elapsed first.
    pub fn wait(&self, duration: Option<Duration>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match duration {
            Some(duration) => {
                let (guard, result) = self
                    .pop_condition
                    .wait_timeout_while(inner, duration, |inner| {
                        inner.queue.is_empty() && !inner.stopping
                    })
                    .unwrap();
                drop(guard);
                !result.timed_out()
            }
            None => {
                while inner.queue.is_empty() && !inner.stopping {
                    inner = self.pop_condition.wait(inner).unwrap();
                }
                true
            }
        }
    }

    fn push_locked(&self, inner: &mut Inner<T>, element: T, added: usize) {
        if inner.stopping {
            return;
        }
        inner.amount += added;
        inner.queue.push_back(element);
        self.pop_condition.notify_one();
    }

    fn pop_locked(&self, inner: &mut Inner<T>) -> Option<T> {
        let element = inner.queue.pop_front()?;
        inner.amount -= (self.amount_function)(&element);
        self.push_condition.notify_all();
        Some(element)
    }
}

impl<T: Clone> Queue<T> {
    pub fn peek(&self) -> Option<T> {
        let inner = self.inner.lock().unwrap();
        inner.queue.front().cloned()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_push_pop_order() {
        let q = Queue::new(0);
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.size(), 3);
        assert_eq!(q.amount(), 3);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn test_amount_function() {
        let q: Queue<Vec<u8>> = Queue::with_amount_function(0, Box::new(|v| v.len()));
        q.push(vec![0; 10]);
        q.push(vec![0; 5]);
        assert_eq!(q.size(), 2);
        assert_eq!(q.amount(), 15);
        q.try_pop();
        assert_eq!(q.amount(), 5);
    }

    #[test]
    fn test_stop_wakes_pop() {
        let q: Arc<Queue<u32>> = Arc::new(Queue::new(0));
        let q2 = Arc::clone(&q);
        let handle = thread::spawn(move || q2.pop());
        thread::sleep(Duration::from_millis(50));
        q.stop();
        assert_eq!(handle.join().unwrap(), None);
        assert!(!q.running());
    }

    #[test]
    fn test_bounded_push_blocks_until_pop() {
        let q: Arc<Queue<u32>> = Arc::new(Queue::new(2));
        q.push(1);
        q.push(2);
        assert!(q.is_full());

        let q2 = Arc::clone(&q);
        let handle = thread::spawn(move || {
            q2.push(3);
        });
        thread::sleep(Duration::from_millis(50));
        assert_eq!(q.size(), 2);
        assert_eq!(q.pop(), Some(1));
        handle.join().unwrap();
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
    }

    #[test]
    fn test_exchange() {
        let q = Queue::new(0);
        assert_eq!(q.exchange(9), None);
        q.push(1);
        q.push(2);
        assert_eq!(q.exchange(9), Some(1));
        assert_eq!(q.pop(), Some(9));
        assert_eq!(q.pop(), Some(2));
    }

    #[test]
    fn test_wait_timeout() {
        let q: Queue<u32> = Queue::new(0);
        assert!(!q.wait(Some(Duration::from_millis(20))));
        q.push(1);
        assert!(q.wait(Some(Duration::from_millis(20))));
    }

    #[test]
    fn test_push_after_stop_discarded() {
        let q = Queue::new(0);
        q.push(1);
        q.stop();
        q.push(2);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), None);
    }
}
