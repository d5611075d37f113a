use super::{AdmissionError, CredentialSelector};
use crate::clock::Clock;
use crate::config::SelectionMode;
use crate::logging::mask_key;
use crate::quota_store::StoreError;
use crate::rate_limit::{Decision, RateLimiter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// 两次重试之间的最短等待，避免时钟误差导致空转。
const MIN_RETRY_DELAY_MS: i64 = 10;

type Reply = oneshot::Sender<Result<String, AdmissionError>>;

/// 一个等待分配 key 的请求。调用方持有接收端；接收端被丢弃即视为取消。
struct Ticket {
    reply: Reply,
}

/// 单次扫描整个池的结果。
enum ScanOutcome {
    Granted(String),
    /// 评估期间调用方已离开，未提交任何配额。
    Cancelled,
    /// 没有可用 key，`until_ms` 为最早恢复的时刻。
    Wait { until_ms: i64 },
    Failed(StoreError),
}

/// 调用方侧的句柄。clone 开销很小，可在每个请求中使用。
#[derive(Debug, Clone)]
pub struct AdmissionHandle {
    tx: mpsc::Sender<Ticket>,
    selector: Arc<CredentialSelector>,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticket")
            .field("closed", &self.reply.is_closed())
            .finish()
    }
}

impl AdmissionHandle {
    /// 为当前请求取得一个上游 key。
    ///
    /// - 轮询模式：直接按共享计数器取 key，不经过队列，不检查配额。
    /// - 配额模式：排队等待调度器分配；超时或调用方被取消时，队列中的票据会被丢弃，不消耗配额。
    pub async fn acquire(&self) -> Result<String, AdmissionError> {
        if self.selector.mode() == SelectionMode::RoundRobin {
            return self
                .selector
                .next_round_robin()
                .await
                .map_err(AdmissionError::Failed);
        }

        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.enqueue_and_wait())
                .await
                .map_err(|_| AdmissionError::TimedOut(limit))?,
            None => self.enqueue_and_wait().await,
        }
    }

    async fn enqueue_and_wait(&self) -> Result<String, AdmissionError> {
        let (reply, rx) = oneshot::channel();
        // 队列有界：满时在这里等待空位。
        self.tx
            .send(Ticket { reply })
            .await
            .map_err(|_| AdmissionError::Closed)?;
        rx.await.map_err(|_| AdmissionError::Closed)?
    }
}

/// 启动唯一的调度任务并返回句柄。所有句柄被丢弃后调度任务随之退出。
pub fn spawn_dispatcher(
    selector: Arc<CredentialSelector>,
    limiter: RateLimiter,
    clock: Arc<dyn Clock>,
    queue_capacity: usize,
    timeout: Option<Duration>,
) -> AdmissionHandle {
    let (tx, rx) = mpsc::channel(queue_capacity.max(1));
    let dispatcher = Dispatcher {
        rx,
        selector: selector.clone(),
        limiter,
        clock,
    };
    tokio::spawn(dispatcher.run());

    AdmissionHandle {
        tx,
        selector,
        timeout,
    }
}

/// 调度器：按 FIFO 逐个处理票据，是唯一会提交（commit）配额的地方，
/// 因此同一进程内不会出现两个请求同时拿到同一个名额。
struct Dispatcher {
    rx: mpsc::Receiver<Ticket>,
    selector: Arc<CredentialSelector>,
    limiter: RateLimiter,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    async fn run(mut self) {
        tracing::debug!(pool = self.selector.pool_size(), "准入调度器已启动");
        while let Some(ticket) = self.rx.recv().await {
            self.serve(ticket).await;
        }
        tracing::debug!("准入调度器退出");
    }

    /// 处理队首票据直到终态；等待期间不处理后续票据（队头阻塞）。
    async fn serve(&self, mut ticket: Ticket) {
        loop {
            if ticket.reply.is_closed() {
                tracing::debug!("调用方已离开，丢弃排队中的请求");
                return;
            }

            match self.scan(&ticket.reply).await {
                ScanOutcome::Granted(credential) => {
                    tracing::debug!(credential = %mask_key(&credential), "已分配上游 key");
                    if ticket.reply.send(Ok(credential)).is_err() {
                        tracing::debug!("分配完成时调用方已离开");
                    }
                    return;
                }
                ScanOutcome::Cancelled => {
                    tracing::debug!("调用方已离开，丢弃排队中的请求");
                    return;
                }
                ScanOutcome::Failed(e) => {
                    tracing::error!(error = %e, "所有上游 key 的配额检查均失败");
                    let _ = ticket.reply.send(Err(AdmissionError::Failed(e)));
                    return;
                }
                ScanOutcome::Wait { until_ms } => {
                    let delay_ms = (until_ms - self.clock.now_millis()).max(MIN_RETRY_DELAY_MS);
                    let delay = Duration::from_millis(u64::try_from(delay_ms).unwrap_or(0));
                    tracing::info!(wait_ms = delay_ms, "所有上游 key 配额已满，等待最早恢复的 key");

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = ticket.reply.closed() => {
                            tracing::debug!("等待期间调用方已离开，丢弃请求");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// 按探测顺序评估每个 key，第一个可用的 key 被提交并返回。
    async fn scan(&self, reply: &Reply) -> ScanOutcome {
        let now = self.clock.now_millis();
        let mut earliest: Option<i64> = None;
        let mut last_error: Option<StoreError> = None;

        for credential in self.selector.probe_order() {
            match self.limiter.evaluate(credential, now).await {
                Ok(Decision::Admitted) => {
                    if reply.is_closed() {
                        return ScanOutcome::Cancelled;
                    }
                    match self.limiter.commit(credential, now).await {
                        Ok(()) => return ScanOutcome::Granted(credential.to_string()),
                        Err(e) => {
                            tracing::warn!(credential = %mask_key(credential), error = %e, "提交配额失败，跳过该 key");
                            last_error = Some(e);
                        }
                    }
                }
                Ok(Decision::Denied {
                    next_eligible_at_ms,
                }) => {
                    earliest = Some(earliest.map_or(next_eligible_at_ms, |at| {
                        at.min(next_eligible_at_ms)
                    }));
                }
                Err(e) => {
                    tracing::warn!(credential = %mask_key(credential), error = %e, "配额检查失败，跳过该 key");
                    last_error = Some(e);
                }
            }
        }

        // 只要还有被正常拒绝的 key，就等它恢复；出错的 key 下一轮再试。
        match (earliest, last_error) {
            (Some(until_ms), _) => ScanOutcome::Wait { until_ms },
            (None, Some(e)) => ScanOutcome::Failed(e),
            (None, None) => ScanOutcome::Failed(StoreError::Unavailable("凭据池为空".to_string())),
        }
    }
}
