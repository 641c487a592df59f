/// Wire command tag, in the stable numeric order used on the wire (§6).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Nothing = 0,
    InPort,
    Handshake,
    HandshakeResp,
    LocalFiles,
    Ping,
    Pong,
    ListReq,
    ListResp,
    CreateReq,
    CreateResp,
    FsReq,
    FsResp,
    OpenReq,
    OpenResp,
    ReadReq,
    DataBlock,
    FileUpdate,
    RmDir,
    RmFile,
    ForwardReq,
    DrmReq,
    DrmResp,
    Rename,
    UpdateDrm,
    MakeAlpha,
}

impl Command {
    pub const COUNT: u8 = 26;
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown command byte {0}")]
pub struct UnknownCommand(pub u8);

impl TryFrom<u8> for Command {
    type Error = UnknownCommand;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use Command::*;
        Ok(match value {
            0 => Nothing,
            1 => InPort,
            2 => Handshake,
            3 => HandshakeResp,
            4 => LocalFiles,
            5 => Ping,
            6 => Pong,
            7 => ListReq,
            8 => ListResp,
            9 => CreateReq,
            10 => CreateResp,
            11 => FsReq,
            12 => FsResp,
            13 => OpenReq,
            14 => OpenResp,
            15 => ReadReq,
            16 => DataBlock,
            17 => FileUpdate,
            18 => RmDir,
            19 => RmFile,
            20 => ForwardReq,
            21 => DrmReq,
            22 => DrmResp,
            23 => Rename,
            24 => UpdateDrm,
            25 => MakeAlpha,
            other => return Err(UnknownCommand(other)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_variant() {
        for byte in 0..Command::COUNT {
            let cmd = Command::try_from(byte).expect("known command");
            assert_eq!(cmd as u8, byte);
        }
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(Command::try_from(Command::COUNT).is_err());
    }
}
