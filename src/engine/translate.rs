use crate::error::{ActionError, ErrorKind, Service};

/// HTTP 상태 코드를 가진 클라이언트 고유 오류가 구현하는 경계 규약이다.
pub trait HttpFailure {
    /// 응답 상태 코드. 네트워크 오류처럼 응답이 없으면 `None`.
    fn http_status(&self) -> Option<u16>;
    /// 보고서에 남길 설명.
    fn detail(&self) -> String;
}

/// HTTP 상태 코드를 공용 오류 분류로 변환한다.
pub fn kind_for_status(status: u16) -> ErrorKind {
    match status {
        400 => ErrorKind::BadRequest,
        401 => ErrorKind::Unauthorized,
        403 => ErrorKind::Forbidden,
        404 => ErrorKind::NotFound,
        409 => ErrorKind::Conflict,
        413 | 429 => ErrorKind::QuotaExceeded,
        _ => ErrorKind::Service,
    }
}

/// 클라이언트 오류를 서비스 경계에서 `ActionError`로 변환한다.
pub fn translate<E: HttpFailure>(service: Service, err: &E) -> ActionError {
    let status = err.http_status();
    ActionError::Service {
        service,
        kind: status.map(kind_for_status).unwrap_or(ErrorKind::Service),
        status,
        message: err.detail(),
    }
}

/// 액션 본문 맨 앞에서 클라이언트 호출 결과를 변환하기 위한 확장 트레이트이다.
pub trait BoundaryExt<T> {
    fn at_boundary(self, service: Service) -> Result<T, ActionError>;
}

impl<T, E: HttpFailure> BoundaryExt<T> for Result<T, E> {
    fn at_boundary(self, service: Service) -> Result<T, ActionError> {
        self.map_err(|err| translate(service, &err))
    }
}
