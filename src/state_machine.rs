//! 系统状态机模块
//!
//! 管理网络连接、UDP服务与运行状态的生命周期。事件先进入固定深度的队列，
//! 由 `StateMachine::run` 逐个取出处理，所有状态变更因此完全串行。

use crate::BoardError;
use core::cell::RefCell;
use core::fmt;
use embassy_futures::select::{Either, select};
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Instant, Timer, with_timeout};
use log::{debug, info, warn};

/// 事件队列深度
pub const EVENT_QUEUE_DEPTH: usize = 10;

/// 事件入队的最长等待时间
pub const EVENT_QUEUE_TIMEOUT: Duration = Duration::from_millis(100);

/// 系统状态枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemState {
    // 初始化状态
    Init,

    // 网络连接状态
    ConnectingNetwork,
    RequestingAddress,
    NetworkReady,

    // 服务状态
    StartingService,
    ListeningService,

    // 运行状态
    Operational,
    ServiceTimeout, // 长时间未收到0x01消息

    // 错误状态
    NetworkError,
    AddressError,
    ServiceError,

    // 恢复状态
    Reconnecting,
}

impl SystemState {
    pub const ALL: [SystemState; 12] = [
        SystemState::Init,
        SystemState::ConnectingNetwork,
        SystemState::RequestingAddress,
        SystemState::NetworkReady,
        SystemState::StartingService,
        SystemState::ListeningService,
        SystemState::Operational,
        SystemState::ServiceTimeout,
        SystemState::NetworkError,
        SystemState::AddressError,
        SystemState::ServiceError,
        SystemState::Reconnecting,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            SystemState::Init => "INIT",
            SystemState::ConnectingNetwork => "CONNECTING_NETWORK",
            SystemState::RequestingAddress => "REQUESTING_ADDRESS",
            SystemState::NetworkReady => "NETWORK_READY",
            SystemState::StartingService => "STARTING_SERVICE",
            SystemState::ListeningService => "LISTENING_SERVICE",
            SystemState::Operational => "OPERATIONAL",
            SystemState::ServiceTimeout => "SERVICE_TIMEOUT",
            SystemState::NetworkError => "NETWORK_ERROR",
            SystemState::AddressError => "ADDRESS_ERROR",
            SystemState::ServiceError => "SERVICE_ERROR",
            SystemState::Reconnecting => "RECONNECTING",
        }
    }

    /// 检查是否处于错误状态
    pub const fn is_error(self) -> bool {
        matches!(
            self,
            SystemState::NetworkError | SystemState::AddressError | SystemState::ServiceError
        )
    }
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 系统事件枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEvent {
    // 系统事件
    InitComplete,

    // 网络事件
    ConnectStart,
    Connected,
    Disconnected,
    ConnectFailed,
    AddressAcquired,
    AddressFailed,
    NetworkReady,

    // UDP事件
    ServiceStart,
    ServiceStarted,
    ServiceFailed,
    ServiceListening,
    ProbeReceived, // 收到0x01消息
    ProbeTimeout,  // 长时间未收到0x01消息

    // 错误和恢复事件
    ErrorRecovery,
    ReconnectStart,
}

impl SystemEvent {
    pub const ALL: [SystemEvent; 16] = [
        SystemEvent::InitComplete,
        SystemEvent::ConnectStart,
        SystemEvent::Connected,
        SystemEvent::Disconnected,
        SystemEvent::ConnectFailed,
        SystemEvent::AddressAcquired,
        SystemEvent::AddressFailed,
        SystemEvent::NetworkReady,
        SystemEvent::ServiceStart,
        SystemEvent::ServiceStarted,
        SystemEvent::ServiceFailed,
        SystemEvent::ServiceListening,
        SystemEvent::ProbeReceived,
        SystemEvent::ProbeTimeout,
        SystemEvent::ErrorRecovery,
        SystemEvent::ReconnectStart,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            SystemEvent::InitComplete => "INIT_COMPLETE",
            SystemEvent::ConnectStart => "CONNECT_START",
            SystemEvent::Connected => "CONNECTED",
            SystemEvent::Disconnected => "DISCONNECTED",
            SystemEvent::ConnectFailed => "CONNECT_FAILED",
            SystemEvent::AddressAcquired => "ADDRESS_ACQUIRED",
            SystemEvent::AddressFailed => "ADDRESS_FAILED",
            SystemEvent::NetworkReady => "NETWORK_READY",
            SystemEvent::ServiceStart => "SERVICE_START",
            SystemEvent::ServiceStarted => "SERVICE_STARTED",
            SystemEvent::ServiceFailed => "SERVICE_FAILED",
            SystemEvent::ServiceListening => "SERVICE_LISTENING",
            SystemEvent::ProbeReceived => "PROBE_RECEIVED",
            SystemEvent::ProbeTimeout => "PROBE_TIMEOUT",
            SystemEvent::ErrorRecovery => "ERROR_RECOVERY",
            SystemEvent::ReconnectStart => "RECONNECT_START",
        }
    }
}

impl fmt::Display for SystemEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 状态转换规则
///
/// 对所有 (状态, 事件) 组合都有定义；无意义的事件保持当前状态。
pub fn transition(state: SystemState, event: SystemEvent) -> SystemState {
    use SystemEvent as E;
    use SystemState as S;

    match (state, event) {
        // 系统启动流程
        (S::Init, E::InitComplete) => S::ConnectingNetwork,

        // 网络连接流程
        (S::ConnectingNetwork, E::Connected) => S::RequestingAddress,
        (S::ConnectingNetwork, E::Disconnected | E::ConnectFailed) => S::NetworkError,

        // DHCP流程
        (S::RequestingAddress, E::AddressAcquired) => S::NetworkReady,
        (S::RequestingAddress, E::AddressFailed) => S::AddressError,

        // 网络就绪后启动UDP服务
        (S::NetworkReady, E::NetworkReady | E::ServiceStart) => S::StartingService,

        // UDP服务启动
        (S::StartingService, E::ServiceStarted) => S::ListeningService,
        (S::StartingService, E::ServiceFailed) => S::ServiceError,

        // UDP监听状态 - 收到0x01消息表示正常
        (S::ListeningService, E::ServiceListening | E::ProbeReceived) => S::Operational,
        (S::ListeningService, E::ServiceFailed) => S::ServiceError,
        (S::ListeningService | S::Operational, E::ProbeTimeout) => S::ServiceTimeout,

        // 正常运行状态
        (S::Operational, E::ServiceFailed) => S::ServiceError,

        // UDP超时处理
        (S::ServiceTimeout, E::ServiceListening) => S::ListeningService,
        (S::ServiceTimeout, E::ProbeReceived) => S::Operational,
        (S::ServiceTimeout, E::ServiceFailed) => S::ServiceError,

        // 重连流程
        (S::NetworkError, E::ConnectStart) => S::ConnectingNetwork,
        (S::NetworkError, E::Connected) => S::RequestingAddress,
        (S::Reconnecting, E::ConnectStart) => S::ConnectingNetwork,

        // 网络断开处理
        (S::Init | S::NetworkError | S::Reconnecting, E::Disconnected) => state,
        (_, E::Disconnected) => S::NetworkError,

        // 错误恢复
        (
            S::ServiceTimeout | S::NetworkError | S::AddressError | S::ServiceError,
            E::ErrorRecovery | E::ReconnectStart,
        ) => S::Reconnecting,

        // 默认情况：保持当前状态
        _ => state,
    }
}

/// 各状态的超时时间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTimeouts {
    pub connecting_network: Duration,
    pub requesting_address: Duration,
    pub starting_service: Duration,
    /// 两次0x01消息之间允许的最长间隔
    pub operational: Duration,
}

impl Default for StateTimeouts {
    fn default() -> Self {
        Self {
            connecting_network: Duration::from_secs(30),
            requesting_address: Duration::from_secs(30),
            starting_service: Duration::from_secs(5),
            operational: Duration::from_secs(60),
        }
    }
}

impl StateTimeouts {
    pub fn for_state(&self, state: SystemState) -> Option<Duration> {
        match state {
            SystemState::ConnectingNetwork => Some(self.connecting_network),
            SystemState::RequestingAddress => Some(self.requesting_address),
            SystemState::StartingService => Some(self.starting_service),
            SystemState::Operational => Some(self.operational),
            _ => None,
        }
    }
}

/// 状态变化回调
///
/// 在状态机任务中同步调用，返回前不会处理下一个事件。回调内只能用
/// `try_handle_event` 追加事件。
pub trait TransitionHandler {
    fn on_transition(&self, from: SystemState, to: SystemState, machine: &StateMachine);

    /// 状态超时；`ErrorRecovery` 已经入队
    fn on_timeout(&self, state: SystemState, machine: &StateMachine) {
        let _ = (state, machine);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Message {
    Event(SystemEvent),
    Force(SystemState),
}

#[derive(Debug, Clone, Copy)]
struct Context {
    current: SystemState,
    previous: Option<SystemState>,
    entered_at: Instant,
    operational: bool,
    error_count: u32,
    deadline: Option<Instant>,
}

/// 系统状态机
pub struct StateMachine {
    queue: Channel<CriticalSectionRawMutex, Message, EVENT_QUEUE_DEPTH>,
    context: Mutex<CriticalSectionRawMutex, RefCell<Context>>,
    timeouts: StateTimeouts,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// 创建新的状态机实例
    pub fn new() -> Self {
        Self::with_timeouts(StateTimeouts::default())
    }

    pub fn with_timeouts(timeouts: StateTimeouts) -> Self {
        Self {
            queue: Channel::new(),
            context: Mutex::new(RefCell::new(Context {
                current: SystemState::Init,
                previous: None,
                entered_at: Instant::now(),
                operational: false,
                error_count: 0,
                deadline: None,
            })),
            timeouts,
        }
    }

    /// 事件入队，队列满时最多等待 `EVENT_QUEUE_TIMEOUT`
    pub async fn handle_event(&self, event: SystemEvent) -> Result<(), BoardError> {
        with_timeout(EVENT_QUEUE_TIMEOUT, self.queue.send(Message::Event(event)))
            .await
            .map_err(|_| {
                warn!("[STATE] Event queue full, dropped {}", event);
                BoardError::Timeout
            })
    }

    /// 非阻塞入队，用于回调和同步上下文
    pub fn try_handle_event(&self, event: SystemEvent) -> Result<(), BoardError> {
        self.queue.try_send(Message::Event(event)).map_err(|_| {
            warn!("[STATE] Event queue full, dropped {}", event);
            BoardError::QueueFull
        })
    }

    /// 强制转换到指定状态（用于诊断），同样经过事件队列
    pub fn force_state(&self, state: SystemState) -> Result<(), BoardError> {
        self.queue
            .try_send(Message::Force(state))
            .map_err(|_| BoardError::QueueFull)
    }

    /// 获取当前状态
    pub fn get_current_state(&self) -> SystemState {
        self.context.lock(|c| c.borrow().current)
    }

    /// 获取上一个状态
    pub fn get_previous_state(&self) -> Option<SystemState> {
        self.context.lock(|c| c.borrow().previous)
    }

    /// 检查是否处于运行状态
    pub fn is_operational(&self) -> bool {
        self.context.lock(|c| c.borrow().operational)
    }

    pub fn state_entered_at(&self) -> Instant {
        self.context.lock(|c| c.borrow().entered_at)
    }

    /// 进入错误状态的累计次数
    pub fn error_count(&self) -> u32 {
        self.context.lock(|c| c.borrow().error_count)
    }

    /// 当前状态的超时时刻
    pub fn deadline(&self) -> Option<Instant> {
        self.context.lock(|c| c.borrow().deadline)
    }

    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }

    /// 状态机任务主循环
    pub async fn run<H: TransitionHandler>(&self, handler: &H) -> ! {
        info!("[STATE] State machine started in {}", self.get_current_state());

        loop {
            let message = match self.deadline() {
                Some(at) => match select(self.queue.receive(), Timer::at(at)).await {
                    Either::First(message) => Some(message),
                    Either::Second(()) => None,
                },
                None => Some(self.queue.receive().await),
            };

            match message {
                Some(message) => self.dispatch(message, handler),
                None => self.expire(handler),
            }
        }
    }

    /// 同步处理队列中已有的事件（包括处理过程中追加的），返回处理数量
    pub fn process_pending<H: TransitionHandler>(&self, handler: &H) -> usize {
        let mut processed = 0;
        while let Ok(message) = self.queue.try_receive() {
            self.dispatch(message, handler);
            processed += 1;
        }
        processed
    }

    fn dispatch<H: TransitionHandler>(&self, message: Message, handler: &H) {
        match message {
            Message::Event(event) => {
                let current = self.get_current_state();
                let next = transition(current, event);
                debug!("[STATE] {} in {}", event, current);

                if next != current {
                    self.perform_transition(next, handler);
                } else if current == SystemState::Operational && event == SystemEvent::ProbeReceived
                {
                    // 0x01消息刷新运行状态的超时
                    self.arm_timeout(current);
                }
            }
            Message::Force(state) => {
                if state == self.get_current_state() {
                    debug!("[STATE] Already in {}, force ignored", state);
                    return;
                }
                warn!("[STATE] Forcing state {}", state);
                self.perform_transition(state, handler);
            }
        }
    }

    /// 内部状态转换逻辑
    fn perform_transition<H: TransitionHandler>(&self, new_state: SystemState, handler: &H) {
        let old_state = self.context.lock(|c| {
            let mut c = c.borrow_mut();
            let old = c.current;
            c.previous = Some(old);
            c.current = new_state;
            c.entered_at = Instant::now();
            c.operational = new_state == SystemState::Operational;
            if new_state.is_error() {
                c.error_count = c.error_count.wrapping_add(1);
            }
            c.deadline = None;
            old
        });

        match new_state {
            SystemState::Operational => info!("[STATE] System operational"),
            s if s.is_error() => warn!("[STATE] Error state: {} (from {})", s, old_state),
            s => info!("[STATE] {} -> {}", old_state, s),
        }

        handler.on_transition(old_state, new_state, self);
        self.arm_timeout(new_state);
    }

    fn arm_timeout(&self, state: SystemState) {
        let deadline = self.timeouts.for_state(state).map(|d| Instant::now() + d);
        self.context.lock(|c| c.borrow_mut().deadline = deadline);
    }

    fn expire<H: TransitionHandler>(&self, handler: &H) {
        let state = self.context.lock(|c| {
            let mut c = c.borrow_mut();
            c.deadline = None;
            c.current
        });
        warn!("[STATE] Timeout in {}", state);

        // 错误已在 try_handle_event 中记录
        let _ = self.try_handle_event(SystemEvent::ErrorRecovery);
        handler.on_timeout(state, self);
    }
}

impl crate::udp_server::EventSink for StateMachine {
    async fn post(&self, event: SystemEvent) -> Result<(), BoardError> {
        self.handle_event(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ignore;

    impl TransitionHandler for Ignore {
        fn on_transition(&self, _: SystemState, _: SystemState, _: &StateMachine) {}
    }

    #[test]
    fn names_are_stable() {
        assert_eq!(SystemState::ServiceTimeout.to_string(), "SERVICE_TIMEOUT");
        assert_eq!(SystemEvent::ProbeReceived.to_string(), "PROBE_RECEIVED");
    }

    #[test]
    fn try_handle_event_reports_full_queue() {
        let sm = StateMachine::new();
        for _ in 0..EVENT_QUEUE_DEPTH {
            sm.try_handle_event(SystemEvent::ConnectStart).unwrap();
        }
        assert_eq!(
            sm.try_handle_event(SystemEvent::ConnectStart),
            Err(BoardError::QueueFull)
        );
        assert_eq!(sm.process_pending(&Ignore), EVENT_QUEUE_DEPTH);
        assert_eq!(sm.pending_events(), 0);
    }

    #[test]
    fn probe_refreshes_operational_deadline() {
        let sm = StateMachine::new();
        sm.force_state(SystemState::Operational).unwrap();
        sm.process_pending(&Ignore);
        let first = sm.deadline().unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        sm.try_handle_event(SystemEvent::ProbeReceived).unwrap();
        sm.process_pending(&Ignore);
        assert!(sm.deadline().unwrap() > first);
        assert_eq!(sm.get_current_state(), SystemState::Operational);
    }

    #[test]
    fn force_state_runs_callback_path() {
        let sm = StateMachine::new();
        sm.force_state(SystemState::AddressError).unwrap();
        sm.process_pending(&Ignore);
        assert_eq!(sm.get_current_state(), SystemState::AddressError);
        assert_eq!(sm.get_previous_state(), Some(SystemState::Init));
        assert_eq!(sm.error_count(), 1);
        assert!(sm.deadline().is_none());
    }

    #[test]
    fn forcing_current_state_is_ignored() {
        let sm = StateMachine::new();
        sm.force_state(SystemState::AddressError).unwrap();
        sm.force_state(SystemState::AddressError).unwrap();
        assert_eq!(sm.process_pending(&Ignore), 2);
        assert_eq!(sm.get_current_state(), SystemState::AddressError);
        assert_eq!(sm.get_previous_state(), Some(SystemState::Init));
        assert_eq!(sm.error_count(), 1);
    }
}
