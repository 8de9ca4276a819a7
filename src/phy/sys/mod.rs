mod linux;

pub(crate) use self::linux::{recv_from, send_to_vectored};
