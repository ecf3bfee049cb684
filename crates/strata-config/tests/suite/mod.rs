mod discovery;
mod logging;
