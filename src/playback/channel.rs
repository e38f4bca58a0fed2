//! Fixed-frame control channel between a controller and the playback thread.
//!
//! Every command travels as a two byte frame `[opcode, payload]`, so a frame
//! is always delivered whole and in FIFO order. The channel is duplex: each
//! `Endpoint` can send to and receive from its peer.

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use thiserror::Error;

/// Length of every command frame in bytes.
pub const FRAME_LEN: usize = 2;

/// A raw command frame: opcode followed by an optional payload byte.
pub type Frame = [u8; FRAME_LEN];

/// Frames that can be buffered before the channel reports `Full`.
const CHANNEL_CAPACITY: usize = 64;

const OP_QUIT: u8 = 1;
const OP_PAUSE: u8 = 2;
const OP_RESUME: u8 = 3;
const OP_SET_VOLUME: u8 = 4;

/// Errors reported by the control channel.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    /// The peer endpoint has been dropped.
    #[error("control channel peer is gone")]
    Closed,
    /// The peer has not read enough frames to make room.
    #[error("control channel is full")]
    Full,
    /// A frame carried an opcode no command maps to.
    #[error("unknown control opcode {0:#04x}")]
    UnknownOpcode(u8),
}

/// A transport command sent to the playback thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Drain, stop and tear down playback.
    Quit,
    /// Mute and stop the queue transport.
    Pause,
    /// Continue the queue transport and restore the volume.
    Resume,
    /// Set the master volume (0-127).
    SetVolume(u8),
}

impl Command {
    /// Encodes the command as a fixed-size frame.
    pub fn encode(self) -> Frame {
        match self {
            Command::Quit => [OP_QUIT, 0],
            Command::Pause => [OP_PAUSE, 0],
            Command::Resume => [OP_RESUME, 0],
            Command::SetVolume(v) => [OP_SET_VOLUME, v],
        }
    }

    /// Decodes a frame back into a command.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::UnknownOpcode` for unrecognized opcodes.
    pub fn decode(frame: Frame) -> Result<Self, ChannelError> {
        match frame[0] {
            OP_QUIT => Ok(Command::Quit),
            OP_PAUSE => Ok(Command::Pause),
            OP_RESUME => Ok(Command::Resume),
            OP_SET_VOLUME => Ok(Command::SetVolume(frame[1])),
            other => Err(ChannelError::UnknownOpcode(other)),
        }
    }
}

/// One side of the duplex control channel.
#[derive(Debug)]
pub struct Endpoint {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
}

/// Creates a connected pair of endpoints (controller side, engine side).
pub fn pair() -> (Endpoint, Endpoint) {
    let (a_tx, b_rx) = crossbeam_channel::bounded(CHANNEL_CAPACITY);
    let (b_tx, a_rx) = crossbeam_channel::bounded(CHANNEL_CAPACITY);
    (
        Endpoint { tx: a_tx, rx: a_rx },
        Endpoint { tx: b_tx, rx: b_rx },
    )
}

impl Endpoint {
    /// Sends a command to the peer without blocking.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::Closed` if the peer endpoint was dropped and
    /// `ChannelError::Full` if the peer is not keeping up.
    pub fn send(&self, command: Command) -> Result<(), ChannelError> {
        self.send_frame(command.encode())
    }

    /// Sends a raw frame to the peer without blocking.
    pub fn send_frame(&self, frame: Frame) -> Result<(), ChannelError> {
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => ChannelError::Full,
            TrySendError::Disconnected(_) => ChannelError::Closed,
        })
    }

    /// Sends a command, waiting for room if the channel is full.
    ///
    /// Only for shutting a peer down, where the caller is about to wait for
    /// it anyway.
    pub fn send_waiting(&self, command: Command) -> Result<(), ChannelError> {
        self.tx
            .send(command.encode())
            .map_err(|_| ChannelError::Closed)
    }

    /// Receives exactly one frame if one is ready.
    ///
    /// Returns `Ok(None)` when nothing is pending.
    pub fn try_receive(&self) -> Result<Option<Frame>, ChannelError> {
        match self.rx.try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(ChannelError::Closed),
        }
    }

    /// The readable side, for use in a multiplexed wait.
    pub fn receiver(&self) -> &Receiver<Frame> {
        &self.rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_frames() {
        assert_eq!(Command::Quit.encode(), [1, 0]);
        assert_eq!(Command::SetVolume(90).encode(), [4, 90]);

        for cmd in [
            Command::Quit,
            Command::Pause,
            Command::Resume,
            Command::SetVolume(0),
            Command::SetVolume(127),
        ] {
            assert_eq!(Command::decode(cmd.encode()), Ok(cmd));
        }
    }

    #[test]
    fn test_unknown_opcode() {
        assert_eq!(
            Command::decode([0, 0]),
            Err(ChannelError::UnknownOpcode(0))
        );
        assert_eq!(
            Command::decode([0x42, 7]),
            Err(ChannelError::UnknownOpcode(0x42))
        );
    }

    #[test]
    fn test_fifo_one_frame_per_receive() {
        let (controller, engine) = pair();
        controller.send(Command::Pause).unwrap();
        controller.send(Command::SetVolume(10)).unwrap();
        controller.send(Command::Resume).unwrap();

        assert_eq!(engine.try_receive().unwrap(), Some(Command::Pause.encode()));
        assert_eq!(
            engine.try_receive().unwrap(),
            Some(Command::SetVolume(10).encode())
        );
        assert_eq!(engine.try_receive().unwrap(), Some(Command::Resume.encode()));
        assert_eq!(engine.try_receive().unwrap(), None);
    }

    #[test]
    fn test_duplex() {
        let (controller, engine) = pair();
        engine.send(Command::Quit).unwrap();
        assert_eq!(controller.try_receive().unwrap(), Some([1, 0]));
    }

    #[test]
    fn test_full_channel_does_not_block() {
        let (controller, engine) = pair();
        for _ in 0..CHANNEL_CAPACITY {
            controller.send(Command::Pause).unwrap();
        }
        assert_eq!(
            controller.send(Command::SetVolume(1)),
            Err(ChannelError::Full)
        );

        // Reading one frame makes room again
        assert_eq!(engine.try_receive().unwrap(), Some(Command::Pause.encode()));
        controller.send(Command::Resume).unwrap();
    }

    #[test]
    fn test_send_waiting_delivers_once_room_frees() {
        let (controller, engine) = pair();
        for _ in 0..CHANNEL_CAPACITY {
            controller.send(Command::Pause).unwrap();
        }

        let reader = std::thread::spawn(move || {
            let mut frames = Vec::new();
            while frames.len() <= CHANNEL_CAPACITY {
                if let Some(frame) = engine.try_receive().unwrap() {
                    frames.push(frame);
                }
            }
            frames
        });
        controller.send_waiting(Command::Quit).unwrap();

        let frames = reader.join().unwrap();
        assert_eq!(frames.last(), Some(&Command::Quit.encode()));
    }

    #[test]
    fn test_send_to_dropped_peer_fails() {
        let (controller, engine) = pair();
        drop(engine);
        assert_eq!(controller.send(Command::Quit), Err(ChannelError::Closed));
        assert_eq!(
            controller.send_waiting(Command::Quit),
            Err(ChannelError::Closed)
        );
        assert_eq!(controller.try_receive(), Err(ChannelError::Closed));
    }
}
