// Actor模块 - 使用Actor模式管理并发状态
//
// 会话的开始与停止通过消息传递串行执行，
// 会话数据只归分析循环所有，不需要 Arc<Mutex<T>>

pub mod session_control;

pub use session_control::{
    SessionControlActor, SessionControlCommand, SessionControlHandle, SessionControlParts,
};
