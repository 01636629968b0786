//! 单次结算的异步结果容器
//!
//! 三种状态：等待中 / 成功 / 失败。第一次 `succeed` 或 `fail` 固定结果，
//! 之后的结算调用全部忽略。晚注册的观察者会立即（同步）收到已结算的结果。
//!
//! 回调式观察用于组合请求完成事件；异步调用方使用 `wait().await`。

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;

type SuccessCallback<T> = Box<dyn FnOnce(&T) + Send>;
type FailureCallback<E> = Box<dyn FnOnce(&E) + Send>;

enum Observer<T, E> {
    Outcome {
        on_success: Option<SuccessCallback<T>>,
        on_failure: Option<FailureCallback<E>>,
    },
    Settled(Box<dyn FnOnce() + Send>),
}

struct DeferredState<T, E> {
    outcome: Option<Result<T, E>>,
    observers: Vec<Observer<T, E>>,
}

/// 单次结算的 Deferred
pub struct Deferred<T, E> {
    state: Arc<Mutex<DeferredState<T, E>>>,
    settled_tx: Arc<watch::Sender<bool>>,
}

impl<T, E> Clone for Deferred<T, E> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            settled_tx: Arc::clone(&self.settled_tx),
        }
    }
}

impl<T, E> std::fmt::Debug for Deferred<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred")
            .field("settled", &self.state.lock().outcome.is_some())
            .finish()
    }
}

impl<T, E> Default for Deferred<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Deferred<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (settled_tx, _) = watch::channel(false);
        Self {
            state: Arc::new(Mutex::new(DeferredState {
                outcome: None,
                observers: Vec::new(),
            })),
            settled_tx: Arc::new(settled_tx),
        }
    }

    /// 以成功结算，已结算时返回 false
    pub fn succeed(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// 以失败结算，已结算时返回 false
    pub fn fail(&self, error: E) -> bool {
        self.settle(Err(error))
    }

    fn settle(&self, outcome: Result<T, E>) -> bool {
        let observers = {
            let mut state = self.state.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome.clone());
            std::mem::take(&mut state.observers)
        };

        // 回调在锁外按注册顺序执行，允许回调内再次观察
        for observer in observers {
            Self::notify(observer, &outcome);
        }

        self.settled_tx.send_replace(true);
        true
    }

    fn notify(observer: Observer<T, E>, outcome: &Result<T, E>) {
        match observer {
            Observer::Outcome {
                on_success,
                on_failure,
            } => match outcome {
                Ok(value) => {
                    if let Some(cb) = on_success {
                        cb(value);
                    }
                }
                Err(error) => {
                    if let Some(cb) = on_failure {
                        cb(error);
                    }
                }
            },
            Observer::Settled(cb) => cb(),
        }
    }

    /// 注册成功/失败回调；已结算时立即执行对应回调
    pub fn observe<S, F>(&self, on_success: S, on_failure: F)
    where
        S: FnOnce(&T) + Send + 'static,
        F: FnOnce(&E) + Send + 'static,
    {
        self.push_observer(Observer::Outcome {
            on_success: Some(Box::new(on_success)),
            on_failure: Some(Box::new(on_failure)),
        });
    }

    /// 无论结果如何，结算后恰好执行一次
    pub fn when_settled<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push_observer(Observer::Settled(Box::new(callback)));
    }

    fn push_observer(&self, observer: Observer<T, E>) {
        let outcome = {
            let mut state = self.state.lock();
            match &state.outcome {
                Some(outcome) => outcome.clone(),
                None => {
                    state.observers.push(observer);
                    return;
                }
            }
        };
        Self::notify(observer, &outcome);
    }

    pub fn is_settled(&self) -> bool {
        self.state.lock().outcome.is_some()
    }

    /// 已结算的结果（未结算返回 None）
    pub fn outcome(&self) -> Option<Result<T, E>> {
        self.state.lock().outcome.clone()
    }

    /// 等待结算并返回结果
    pub async fn wait(&self) -> Result<T, E> {
        let mut rx = self.settled_tx.subscribe();
        loop {
            if let Some(outcome) = self.outcome() {
                return outcome;
            }
            // 发送端由自身持有，不会关闭
            if rx.changed().await.is_err() {
                if let Some(outcome) = self.outcome() {
                    return outcome;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_settle_only_once() {
        let deferred: Deferred<u32, String> = Deferred::new();
        assert!(deferred.succeed(1));
        assert!(!deferred.succeed(2));
        assert!(!deferred.fail("late".to_string()));
        assert_eq!(deferred.outcome(), Some(Ok(1)));
    }

    #[test]
    fn test_observers_run_in_registration_order() {
        let deferred: Deferred<u32, String> = Deferred::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            deferred.observe(move |v| order.lock().push((i, *v)), |_| {});
        }
        deferred.succeed(7);

        assert_eq!(*order.lock(), vec![(0, 7), (1, 7), (2, 7)]);
    }

    #[test]
    fn test_late_observer_replayed() {
        let deferred: Deferred<u32, String> = Deferred::new();
        deferred.fail("boom".to_string());

        let seen = Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();
        deferred.observe(|_| panic!("不应调用成功回调"), move |e| {
            *seen_clone.lock() = Some(e.clone());
        });

        assert_eq!(seen.lock().as_deref(), Some("boom"));
    }

    #[test]
    fn test_when_settled_fires_once() {
        let deferred: Deferred<(), ()> = Deferred::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        deferred.when_settled(move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        deferred.fail(());
        deferred.succeed(());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_debug_shows_settlement() {
        let deferred: Deferred<u32, String> = Deferred::new();
        assert_eq!(format!("{:?}", deferred), "Deferred { settled: false }");
        deferred.fail("boom".to_string());
        assert_eq!(format!("{:?}", deferred), "Deferred { settled: true }");
    }

    #[tokio::test]
    async fn test_wait_from_other_task() {
        let deferred: Deferred<String, String> = Deferred::new();
        let waiter = {
            let deferred = deferred.clone();
            tokio::spawn(async move { deferred.wait().await })
        };

        tokio::task::yield_now().await;
        deferred.succeed("done".to_string());

        let result = waiter.await.unwrap();
        assert_eq!(result, Ok("done".to_string()));
    }
}
