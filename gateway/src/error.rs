use common::{TaskId, TaskState};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    /// Falta un parámetro obligatorio o viene mal formado
    #[error("parámetro inválido: {0}")]
    BadParameter(String),

    /// No se pudo construir la sesión/credencial para la infraestructura
    #[error("error de infraestructura: {0}")]
    Infrastructure(String),

    #[error("tipo de infraestructura desconocido: {0}")]
    UnknownInfrastructureType(String),

    #[error("tipo de infraestructura {0} reconocido pero no soportado")]
    NotImplemented(String),

    #[error("no hay recursos disponibles de tipo {0}")]
    NoResourceAvailable(String),

    #[error("cola de monitoreo llena (capacidad {capacity})")]
    QueueFull { capacity: usize },

    #[error("el gateway se está apagando")]
    ShuttingDown,

    /// Falla remota pasajera (red, middleware caído...)
    #[error("error del backend: {0}")]
    Backend(String),

    #[error("falló el submit: {0}")]
    Submission(String),

    #[error("tarea no encontrada: {0}")]
    TaskNotFound(TaskId),

    #[error("aplicación no encontrada: {0}")]
    ApplicationNotFound(String),

    #[error("infraestructura no encontrada: {0}")]
    InfrastructureNotFound(String),

    #[error("la tarea {0} ya está en un estado terminal")]
    TaskTerminal(TaskId),

    #[error("transición inválida {from} -> {to} en la tarea {id}")]
    InvalidTransition {
        id: TaskId,
        from: TaskState,
        to: TaskState,
    },

    /// Violación de contrato interno (bug)
    #[error("violación de contrato: {0}")]
    Contract(String),

    #[error("error de storage: {0}")]
    Storage(#[from] std::io::Error),
}

impl GatewayError {
    /// Errores de configuración: no tiene sentido reintentar sin cambiar parámetros.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            GatewayError::BadParameter(_)
                | GatewayError::Infrastructure(_)
                | GatewayError::UnknownInfrastructureType(_)
                | GatewayError::NotImplemented(_)
        )
    }

    /// Errores que se pueden reintentar más tarde.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Backend(_)
                | GatewayError::NoResourceAvailable(_)
                | GatewayError::QueueFull { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
