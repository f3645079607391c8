use tracing::info;
use ulid::Ulid;

use crate::config::CatalogSeed;
use crate::limits::*;
use crate::model::*;

use super::validate::{validate_groups, validate_name};
use super::{Engine, EngineError};

impl Engine {
    pub async fn register_computer(&self, computer: Computer) -> Result<(), EngineError> {
        validate_name(computer.name.as_deref())?;
        validate_groups(&computer.groups)?;
        let _admin = self.admin.lock().await;
        if self.catalog.contains_computer(&computer.id) {
            return Err(EngineError::AlreadyExists(computer.id));
        }
        if self.catalog.computer_count() >= MAX_COMPUTERS {
            return Err(EngineError::LimitExceeded("too many computers"));
        }
        if let Some(image_id) = computer.image_id
            && !self.catalog.contains_image(&image_id)
        {
            return Err(EngineError::NotFound(image_id));
        }
        let id = computer.id;
        self.persist_catalog(Event::ComputerRegistered { computer }).await?;
        info!("registered computer {id}");
        Ok(())
    }

    pub async fn register_image(&self, image: Image) -> Result<(), EngineError> {
        validate_name(image.name.as_deref())?;
        validate_groups(&image.groups)?;
        if image.max_concurrent == Some(0) {
            return Err(EngineError::LimitExceeded("image cap must be positive"));
        }
        let _admin = self.admin.lock().await;
        if self.catalog.contains_image(&image.id) {
            return Err(EngineError::AlreadyExists(image.id));
        }
        if self.catalog.image_count() >= MAX_IMAGES {
            return Err(EngineError::LimitExceeded("too many images"));
        }
        let id = image.id;
        self.persist_catalog(Event::ImageRegistered { image }).await?;
        info!("registered image {id}");
        Ok(())
    }

    /// Soft-delete: live reservations of the image are kept, new ones are refused.
    pub async fn delete_image(&self, id: Ulid) -> Result<(), EngineError> {
        let _admin = self.admin.lock().await;
        let image = self.catalog.get_image(&id).ok_or(EngineError::NotFound(id))?;
        if image.deleted {
            return Ok(());
        }
        self.persist_catalog(Event::ImageDeleted { id }).await?;
        info!("deleted image {id}");
        Ok(())
    }

    /// Out-of-band state from the state-sync collaborator.
    pub async fn set_computer_state(&self, id: Ulid, state: ComputerState) -> Result<(), EngineError> {
        let _admin = self.admin.lock().await;
        let computer = self.catalog.get_computer(&id).ok_or(EngineError::NotFound(id))?;
        if computer.state == state {
            return Ok(());
        }
        self.persist_catalog(Event::ComputerStateChanged { id, state }).await?;
        info!("computer {id}: {} -> {}", computer.state.as_str(), state.as_str());
        Ok(())
    }

    /// Register every seed entry not already present. Returns how many were added.
    pub async fn seed_catalog(&self, seed: CatalogSeed) -> Result<usize, EngineError> {
        let mut added = 0;
        for image in seed.images {
            match self.register_image(image).await {
                Ok(()) => added += 1,
                Err(EngineError::AlreadyExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        for computer in seed.computers {
            match self.register_computer(computer).await {
                Ok(()) => added += 1,
                Err(EngineError::AlreadyExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(added)
    }
}
