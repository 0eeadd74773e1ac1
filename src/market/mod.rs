// Market data: live trade streams into per-symbol indicator caches
pub mod binance_ws;
pub mod feed;

pub use binance_ws::BinanceTradeStream;
pub use feed::{
    FeedConfig, FeedEvent, FeedHandles, MarketDataFeed, PriceBoard, SequenceCheck, SequenceTracker, TickSource,
    TickStream,
};
