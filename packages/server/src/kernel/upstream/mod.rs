// External collaborators, behind traits: the browser-manager agent, the
// proxied upstream API, and the watermark rewrite service. The kernel only
// sees these seams; concrete HTTP implementations live alongside.

pub mod agent;
pub mod api;
pub mod testing;
pub mod traits;
pub mod watermark;

pub use traits::{
    BrowserManager, BrowserSession, PollReply, ProfileInfo, ProfileRoute, PublishReply,
    SubmitReply, SubmitSpec, UpstreamClient, WatermarkRewriter,
};
