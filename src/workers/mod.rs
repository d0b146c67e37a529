pub mod dispatcher;
pub mod encoder;
pub mod playlist;
pub mod pool;
pub mod reconciler;
pub mod transcoder;
