//! Client for the commerce backend.
//!
//! One [`CommerceClient`] serves every commerce endpoint the checkout needs:
//!
//! | Trait | Endpoint |
//! |---|---|
//! | [`ShippingQuoter`] | `POST checkout/calculate` |
//! | [`DiscountValidator`] | `POST discounts/validate` |
//! | [`GiftCardValidator`] | `POST gift-cards/validate` |
//! | [`OrderStore`] | `POST orders` |
//! | [`PermitSource`] | `POST rewards/permit` |

use cartsettle::cart::CheckoutSnapshot;
use cartsettle::materializer::{OrderRequest, OrderResponse, OrderStore};
use cartsettle::resolver::{
    DiscountValidation, DiscountValidationRequest, DiscountValidator, GiftCardValidation,
    GiftCardValidationRequest, GiftCardValidator,
};
use cartsettle::shipping::{QuoteRequest, ShippingQuoter};
use cartsettle::{BoxError, BoxFuture};
use cartsettle_evm::claim::rewards::{PermitRequest, PermitSource, RewardPermit};
use url::Url;

use crate::client::{ApiClient, ApiClientError, spanned};

/// Commerce API client.
#[derive(Clone, Debug)]
pub struct CommerceClient {
    api: ApiClient,
    calculate_url: Url,
    discounts_url: Url,
    gift_cards_url: Url,
    orders_url: Url,
    permits_url: Url,
}

impl CommerceClient {
    /// Builds the endpoint URLs under the API's base URL.
    ///
    /// # Errors
    ///
    /// Returns [`ApiClientError::UrlParse`] if an endpoint URL cannot be
    /// constructed.
    pub fn try_new(api: ApiClient) -> Result<Self, ApiClientError> {
        Ok(Self {
            calculate_url: api.endpoint("checkout/calculate")?,
            discounts_url: api.endpoint("discounts/validate")?,
            gift_cards_url: api.endpoint("gift-cards/validate")?,
            orders_url: api.endpoint("orders")?,
            permits_url: api.endpoint("rewards/permit")?,
            api,
        })
    }

    /// Sends `POST checkout/calculate`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiClientError`] if the request fails.
    pub async fn calculate(&self, request: &QuoteRequest) -> Result<CheckoutSnapshot, ApiClientError> {
        spanned!(
            self.api.post_json(&self.calculate_url, "POST /checkout/calculate", request),
            "commerce.calculate",
            items = request.line_items.len()
        )
    }

    /// Sends `POST discounts/validate`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiClientError`] if the request fails.
    pub async fn validate_discount(
        &self,
        request: &DiscountValidationRequest,
    ) -> Result<DiscountValidation, ApiClientError> {
        spanned!(
            self.api.post_json(&self.discounts_url, "POST /discounts/validate", request),
            "commerce.validate_discount",
            code = %request.code
        )
    }

    /// Sends `POST gift-cards/validate`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiClientError`] if the request fails.
    pub async fn validate_gift_card(
        &self,
        request: &GiftCardValidationRequest,
    ) -> Result<GiftCardValidation, ApiClientError> {
        spanned!(
            self.api.post_json(&self.gift_cards_url, "POST /gift-cards/validate", request),
            "commerce.validate_gift_card"
        )
    }

    /// Sends `POST orders`.
    ///
    /// A client-error response that carries an order response body is
    /// returned as that body, so that a refusal is reported as a rejection
    /// rather than an outage.
    ///
    /// # Errors
    ///
    /// Returns [`ApiClientError`] if the request fails.
    pub async fn create_order(&self, request: &OrderRequest) -> Result<OrderResponse, ApiClientError> {
        let result = spanned!(
            self.api.post_json(&self.orders_url, "POST /orders", request),
            "commerce.create_order",
            order_id = %request.order_id,
            proof = %request.settlement_proof
        );
        match result {
            Err(ApiClientError::HttpStatus { status, body, .. }) if status.is_client_error() => {
                serde_json::from_str::<OrderResponse>(&body).map_err(|_| ApiClientError::HttpStatus {
                    context: "POST /orders",
                    status,
                    body,
                })
            }
            other => other,
        }
    }

    /// Sends `POST rewards/permit`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiClientError`] if the request fails.
    pub async fn reward_permit(&self, request: &PermitRequest) -> Result<RewardPermit, ApiClientError> {
        spanned!(
            self.api.post_json(&self.permits_url, "POST /rewards/permit", request),
            "commerce.reward_permit",
            token = %request.token
        )
    }
}

impl ShippingQuoter for CommerceClient {
    fn quote<'a>(
        &'a self,
        request: &'a QuoteRequest,
    ) -> BoxFuture<'a, Result<CheckoutSnapshot, BoxError>> {
        Box::pin(async move { Ok(self.calculate(request).await?) })
    }
}

impl DiscountValidator for CommerceClient {
    fn validate_discount<'a>(
        &'a self,
        request: &'a DiscountValidationRequest,
    ) -> BoxFuture<'a, Result<DiscountValidation, BoxError>> {
        Box::pin(async move { Ok(Self::validate_discount(self, request).await?) })
    }
}

impl GiftCardValidator for CommerceClient {
    fn validate_gift_card<'a>(
        &'a self,
        request: &'a GiftCardValidationRequest,
    ) -> BoxFuture<'a, Result<GiftCardValidation, BoxError>> {
        Box::pin(async move { Ok(Self::validate_gift_card(self, request).await?) })
    }
}

impl OrderStore for CommerceClient {
    fn create_order<'a>(
        &'a self,
        request: &'a OrderRequest,
    ) -> BoxFuture<'a, Result<OrderResponse, BoxError>> {
        Box::pin(async move { Ok(Self::create_order(self, request).await?) })
    }
}

impl PermitSource for CommerceClient {
    fn fetch_permit<'a>(
        &'a self,
        request: &'a PermitRequest,
    ) -> BoxFuture<'a, Result<RewardPermit, BoxError>> {
        Box::pin(async move { Ok(self.reward_permit(request).await?) })
    }
}
