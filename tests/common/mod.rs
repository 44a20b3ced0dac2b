pub(crate) mod logging;

pub(crate) mod replies;

pub(crate) mod worker;
