use std::sync::Arc;

use tracing::debug;

use super::client::{Error, ListOptions, ListerWatcher};
use super::resource::{ObjectList, Resource};

pub const DEFAULT_PAGE_SIZE: u32 = 500;

/// Drives a bulk list in chunks and concatenates the pages into a single
/// list with the terminal resource version.
///
/// A continuation can expire server side while paging; the pager then falls
/// back to one unpaginated list.
pub struct Pager<R: Resource> {
    lister: Arc<dyn ListerWatcher<R>>,
    page_size: u32,
}

impl<R: Resource> Pager<R> {
    pub fn new(lister: Arc<dyn ListerWatcher<R>>) -> Self {
        Self {
            lister,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Overrides the requested chunk size. Zero keeps the default.
    pub fn page_size(mut self, size: u32) -> Self {
        if size != 0 {
            self.page_size = size;
        }
        self
    }

    pub async fn list(&self, options: ListOptions) -> Result<ObjectList<R>, Error> {
        let mut paged = options.clone();
        paged.limit = Some(self.page_size);
        paged.continue_token = None;

        let mut items: Vec<R> = Vec::new();
        let mut first_page = true;

        loop {
            let list = match self.lister.list(&paged).await {
                Ok(list) => list,
                Err(err) if err.is_expired() => {
                    debug!(message = "paged list expired, falling back to full list", %err);

                    let mut full = options;
                    full.limit = None;
                    full.continue_token = None;
                    return self.lister.list(&full).await;
                }
                Err(err) => return Err(err),
            };

            let done = list.metadata.r#continue.as_deref().is_none_or(str::is_empty);
            if first_page && done {
                return Ok(list);
            }
            first_page = false;

            let ObjectList { metadata, items: page } = list;
            items.extend(page);

            if done {
                return Ok(ObjectList { metadata, items });
            }
            paged.continue_token = metadata.r#continue;
        }
    }
}
