mod command;
mod frame;
mod netaddr;

pub use command::{Command, UnknownCommand};
pub use frame::{
    Frame, FrameReader, FrameWriter, HEADER_SIZE, MAX_FRAME_LEN, MAX_RAW_RECV_LEN, is_valid_length,
};
pub use netaddr::NetAddress;
