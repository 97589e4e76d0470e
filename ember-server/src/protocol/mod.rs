/// RESP wire codec. The durability log file and the replication
/// stream are both sequences of RESP command arrays, so the codec is
/// shared by the log writer, the compactor, and both replication ends.
pub mod resp;

pub use resp::{decode_command, encode_command, RespError, RespReader};
