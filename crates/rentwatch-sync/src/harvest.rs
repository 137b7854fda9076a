use chrono::NaiveDate;
use rentwatch_adapters::{BearerToken, FetchError, PageFetcher};
use rentwatch_core::{Furnishing, HarvestBatch, ListingRecord};
use tracing::{debug, info, warn};

use crate::settings::FacetFailurePolicy;

#[derive(Debug, Default)]
pub struct HarvestReport {
    pub batch: HarvestBatch,
    /// Facets that failed under [`FacetFailurePolicy::Isolate`].
    pub failures: Vec<FetchError>,
}

/// Exhausts every page of every facet, in the order given.
pub struct HarvestDriver {
    fetcher: Box<dyn PageFetcher>,
    policy: FacetFailurePolicy,
}

impl HarvestDriver {
    pub fn new(fetcher: Box<dyn PageFetcher>, policy: FacetFailurePolicy) -> Self {
        Self { fetcher, policy }
    }

    pub async fn harvest(
        &self,
        facets: &[Furnishing],
        token: &BearerToken,
        run_date: NaiveDate,
    ) -> Result<HarvestReport, FetchError> {
        let mut report = HarvestReport::default();

        for &facet in facets {
            match self.harvest_facet(facet, token, run_date).await {
                Ok((pages, records)) => {
                    info!(%facet, pages, records = records.len(), "facet harvested");
                    report.batch.push_facet(facet, pages, records);
                }
                Err(err) => match self.policy {
                    FacetFailurePolicy::Abort => return Err(err),
                    FacetFailurePolicy::Isolate => {
                        warn!(
                            %facet,
                            page = err.page(),
                            error = %err,
                            "facet dropped from this run"
                        );
                        report.failures.push(err);
                    }
                },
            }
        }

        Ok(report)
    }

    /// Pages are fetched until `page > total_pages`, with `total_pages` taken
    /// from the latest response. Returns the number of requests made.
    async fn harvest_facet(
        &self,
        facet: Furnishing,
        token: &BearerToken,
        run_date: NaiveDate,
    ) -> Result<(u32, Vec<ListingRecord>), FetchError> {
        let mut records = Vec::new();
        let mut total_pages: u32 = 1;
        let mut page: u32 = 1;
        let mut requests: u32 = 0;

        while page <= total_pages {
            let result = self.fetcher.fetch_page(facet, page, token).await?;
            requests += 1;

            if page > 1 && result.total_pages != total_pages {
                debug!(
                    %facet,
                    page,
                    previous = total_pages,
                    total_pages = result.total_pages,
                    "page count changed mid-harvest"
                );
            }
            records.extend(result.records.into_iter().map(|mut record| {
                record.stamp(facet, run_date);
                record
            }));

            total_pages = result.total_pages;
            page += 1;
        }

        Ok((requests, records))
    }
}
