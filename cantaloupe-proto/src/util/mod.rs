pub(crate) use self::args::split_args;
pub(crate) use self::chunks::ChunkList;
pub(crate) use self::lines::crlf_lines;
pub use self::uint::ParseUintError;
pub(crate) use self::uint::{parse_u16, parse_u64, parse_usize};

mod args;
mod chunks;
mod lines;
mod uint;
