//! Client for the cross-chain aggregator API.

use cartsettle::aggregator::{
    AggregatorApi, CreatePaymentRequest, CreatedPayment, PaymentStatusResponse,
};
use cartsettle::{BoxError, BoxFuture};
use url::Url;

use crate::client::{ApiClient, ApiClientError, spanned};

/// Header carrying the aggregator API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Aggregator API client.
#[derive(Clone, Debug)]
pub struct AggregatorClient {
    api: ApiClient,
    payments_url: Url,
}

impl AggregatorClient {
    /// Creates a client authenticating with `api_key`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiClientError`] if the key is not a valid header value or
    /// the payments URL cannot be built.
    pub fn try_new(api: ApiClient, api_key: &str) -> Result<Self, ApiClientError> {
        let api = api.with_header(API_KEY_HEADER, api_key)?;
        Ok(Self {
            payments_url: api.endpoint("payments")?,
            api,
        })
    }

    /// Sends `POST payments`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiClientError`] if the request fails.
    pub async fn create(&self, request: &CreatePaymentRequest) -> Result<CreatedPayment, ApiClientError> {
        spanned!(
            self.api.post_json(&self.payments_url, "POST /payments", request),
            "aggregator.create_payment",
            order_id = %request.order_id
        )
    }

    /// Sends `GET payments/{id}`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiClientError`] if the request fails.
    pub async fn status(&self, payment_id: &str) -> Result<PaymentStatusResponse, ApiClientError> {
        let url = self.api.endpoint(&format!("payments/{payment_id}"))?;
        spanned!(
            self.api.get_json(&url, "GET /payments/{id}"),
            "aggregator.payment_status",
            payment_id = %payment_id
        )
    }
}

impl AggregatorApi for AggregatorClient {
    fn create_payment<'a>(
        &'a self,
        request: &'a CreatePaymentRequest,
    ) -> BoxFuture<'a, Result<CreatedPayment, BoxError>> {
        Box::pin(async move { Ok(self.create(request).await?) })
    }

    fn payment_status<'a>(
        &'a self,
        payment_id: &'a str,
    ) -> BoxFuture<'a, Result<PaymentStatusResponse, BoxError>> {
        Box::pin(async move { Ok(self.status(payment_id).await?) })
    }
}
