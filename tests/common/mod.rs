pub(crate) mod logging;

pub(crate) mod transport;

pub(crate) mod wait;
