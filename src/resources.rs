use crate::client::ApiClient;
use crate::error::ApiError;
use crate::transport::{ApiResponse, RequestOptions};
use serde_json::Value;
use std::fmt::Display;
use std::time::Duration;

/// Распознавание номеров на сервере заметно медленнее остальных эндпоинтов
pub const PLATE_RECOGNITION_TIMEOUT: Duration = Duration::from_secs(60);

pub mod names {
    pub const PROPIETARIOS: &str = "propietarios";
    pub const UNIDADES: &str = "unidades";
    pub const VISITAS: &str = "visitas";
    pub const RESERVAS: &str = "reservas";
    pub const VEHICULOS: &str = "vehiculos";
    pub const EXPENSAS: &str = "expensas";
    pub const PAGOS: &str = "pagos";
    pub const COMUNICADOS: &str = "comunicados";
    pub const AREAS: &str = "areas";
    pub const REPORTES: &str = "reportes";
}

/// REST-ресурс DRF: `/name/` и `/name/{id}/`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    name: String,
}

impl Resource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().trim_matches('/').to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn collection_path(&self) -> String {
        format!("/{}/", self.name)
    }

    pub fn item_path(&self, id: impl Display) -> String {
        format!("/{}/{}/", self.name, id)
    }

    pub async fn list(
        &self,
        client: &ApiClient,
        query: Vec<(String, String)>,
    ) -> Result<ApiResponse, ApiError> {
        client
            .get(&self.collection_path(), query, RequestOptions::default())
            .await
    }

    pub async fn retrieve(
        &self,
        client: &ApiClient,
        id: impl Display,
    ) -> Result<ApiResponse, ApiError> {
        client
            .get(&self.item_path(id), Vec::new(), RequestOptions::default())
            .await
    }

    pub async fn create(
        &self,
        client: &ApiClient,
        body: Value,
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        client.post(&self.collection_path(), body, options).await
    }

    pub async fn update(
        &self,
        client: &ApiClient,
        id: impl Display,
        body: Value,
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        client.put(&self.item_path(id), body, options).await
    }

    pub async fn partial_update(
        &self,
        client: &ApiClient,
        id: impl Display,
        body: Value,
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        client.patch(&self.item_path(id), body, options).await
    }

    pub async fn destroy(
        &self,
        client: &ApiClient,
        id: impl Display,
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        client.delete(&self.item_path(id), options).await
    }

    /// Действие над записью: PATCH `/name/{id}/{action}/` (например, `confirm` у reservas)
    pub async fn action(
        &self,
        client: &ApiClient,
        id: impl Display,
        action: &str,
        body: Value,
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        let path = format!("/{}/{}/{}/", self.name, id, action.trim_matches('/'));
        client.patch(&path, body, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let reservas = Resource::new(names::RESERVAS);
        assert_eq!(reservas.collection_path(), "/reservas/");
        assert_eq!(reservas.item_path(7), "/reservas/7/");
        assert_eq!(Resource::new("/pagos/").collection_path(), "/pagos/");
    }
}
