//! Error types for the VK message transport

use thiserror::Error;

/// VK transport error types
#[derive(Debug, Error)]
pub enum VkError {
    /// Every message id in the bitmap is in flight
    #[error("Message id space exhausted")]
    MsgIdOverflow,

    /// Queue geometry already synced and no force requested
    #[error("Message queues already in sync")]
    AlreadySynced,

    /// Block count does not match the size field of the first block
    #[error("Message spans {blocks} blocks but header declares {declared}")]
    SizeMismatch { blocks: usize, declared: usize },

    /// Ring stayed full for the whole retry budget
    #[error("Queue {0} is full")]
    Busy(u32),

    /// The card published bad ring state; transport access is blocked
    #[error("Protocol fault: {0}")]
    Protocol(String),

    /// Context pool exhausted
    #[error("All contexts in use")]
    ContextsInUse,

    /// A reset is in flight, no new sessions are accepted
    #[error("Device is in reset (initiated by pid {0})")]
    InReset(u32),

    /// Another reset already owns the device
    #[error("Reset already launched by pid {0}")]
    ResetInProgress(u32),

    /// Only a process with an open session may reset the card
    #[error("Pid {0} holds no session")]
    NoSession(u32),

    /// Write size is not a whole number of blocks
    #[error("Size {0} is not a multiple of the block size")]
    Misaligned(usize),

    /// Caller buffer cannot hold the pending response
    #[error("Response needs {required} bytes")]
    MessageTooLarge { required: usize },

    /// Message does not fit in the target queue
    #[error("Message of {blocks} blocks exceeds queue capacity {max}")]
    QueueOverflow { blocks: usize, max: usize },

    /// Queue number outside the synced range
    #[error("Invalid queue number {0}")]
    InvalidQueue(u32),

    /// Transport has not been synced or has been blocked
    #[error("Message queues not ready")]
    NotReady,

    /// No response pending for this session
    #[error("No message pending")]
    NoMessage,

    /// Buffer transfers are refused during reset
    #[error("Buffer transfer not allowed during reset")]
    TransferDuringReset,

    /// Scatter-gather mapping failed
    #[error("DMA error: {0}")]
    Dma(String),

    /// Configuration could not be parsed
    #[error("Config error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for VK transport operations
pub type Result<T> = std::result::Result<T, VkError>;

impl VkError {
    /// Check if the caller may simply retry later
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::MsgIdOverflow | Self::Busy(_) | Self::ContextsInUse | Self::NoMessage
        )
    }

    /// Check if this error blocked the transport
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }

    /// Negative errno as returned by the file interface
    pub fn errno(&self) -> i32 {
        let code = match self {
            Self::MsgIdOverflow | Self::QueueOverflow { .. } => libc::EOVERFLOW,
            Self::AlreadySynced | Self::NotReady => libc::EPERM,
            Self::SizeMismatch { .. } | Self::MessageTooLarge { .. } => libc::EMSGSIZE,
            Self::Busy(_) => libc::EAGAIN,
            Self::Protocol(_) => libc::EIO,
            Self::ContextsInUse => libc::ENOMEM,
            Self::InReset(_) | Self::ResetInProgress(_) | Self::TransferDuringReset => {
                libc::EACCES
            }
            Self::Misaligned(_) => libc::EBADR,
            Self::InvalidQueue(_) | Self::Config(_) => libc::EINVAL,
            Self::NoSession(_) => libc::EBADF,
            Self::NoMessage => libc::ENOMSG,
            Self::Dma(_) => libc::EFAULT,
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        };
        -code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(VkError::Busy(0).errno(), -libc::EAGAIN);
        assert_eq!(VkError::Misaligned(7).errno(), -libc::EBADR);
        assert_eq!(
            VkError::MessageTooLarge { required: 64 }.errno(),
            -libc::EMSGSIZE
        );
        assert_eq!(VkError::NoMessage.errno(), -libc::ENOMSG);
    }

    #[test]
    fn test_recoverable() {
        assert!(VkError::Busy(1).is_recoverable());
        assert!(VkError::MsgIdOverflow.is_recoverable());
        assert!(!VkError::Protocol("bad".into()).is_recoverable());
        assert!(VkError::Protocol("bad".into()).is_fatal());
    }
}
