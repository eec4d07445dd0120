//! Binary encoding/decoding of the pickle opcode stream.
//!
//! The decoder accepts protocols 0 through 5; the encoder writes 2 through
//! 5, protocol 2 by default.

pub mod decode;
pub mod encode;
pub mod opcode;
pub mod primitives;

pub use decode::{decode_pickle, decode_pickle_global, DecodeOptions, Decoded};
pub use encode::{encode_pickle, EncodeOptions};
pub use opcode::{disassemble, Arg, Instruction, Opcode};
pub use primitives::{Reader, Writer};
