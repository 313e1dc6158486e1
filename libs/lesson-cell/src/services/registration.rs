use std::sync::Arc;

use chrono::Months;
use tracing::{info, instrument};
use uuid::Uuid;

use shared_models::{Actor, AppError};

use crate::models::{CourseRegistration, NewRegistration, PaymentStatus};
use crate::store::LessonStore;

/// Enrolls students in courses and tracks their payment state.
pub struct RegistrationService {
    store: Arc<dyn LessonStore>,
}

impl RegistrationService {
    pub fn new(store: Arc<dyn LessonStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self, request), fields(actor = %actor.user_id))]
    pub async fn register(&self, actor: &Actor, request: NewRegistration) -> Result<CourseRegistration, AppError> {
        if !actor.is_staff() {
            return Err(AppError::Forbidden("only staff may register students".to_string()));
        }

        let course = self
            .store
            .course(request.course_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("course {}", request.course_id)))?;
        if course.school_id != actor.school_id {
            return Err(AppError::Forbidden(format!("course {} belongs to another school", course.id)));
        }

        let teacher_id = if course.is_group {
            None
        } else {
            let teacher_id = request
                .teacher_id
                .ok_or_else(|| AppError::Validation(format!("{} is a private course and needs a teacher", course.name)))?;
            let teacher = self
                .store
                .teacher(teacher_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("teacher {}", teacher_id)))?;
            if !teacher.teaches(course.id) {
                return Err(AppError::Validation(format!(
                    "teacher {} does not teach {}",
                    teacher.full_name(),
                    course.name
                )));
            }
            Some(teacher.id)
        };

        let lessons_left = request.lessons_override.unwrap_or(course.number_of_lessons);
        if lessons_left < 0 {
            return Err(AppError::Validation("lessons cannot be negative".to_string()));
        }

        let exp_date = if course.no_exp {
            None
        } else {
            let months = u32::try_from(course.exp_range)
                .map_err(|_| AppError::Validation(format!("invalid expiry range {}", course.exp_range)))?;
            Some(
                request
                    .registered_date
                    .checked_add_months(Months::new(months))
                    .ok_or_else(|| AppError::Validation("expiry date out of range".to_string()))?,
            )
        };

        let registration = CourseRegistration {
            uuid: Uuid::new_v4(),
            student_id: request.student_id,
            course_id: course.id,
            teacher_id,
            registered_date: request.registered_date,
            lessons_left,
            exp_date,
            payment_status: request.payment_status,
        };

        self.store.insert_registration(&registration).await?;
        info!(
            "Registered student {} for {} ({} lessons)",
            registration.student_id, course.name, registration.lessons_left
        );

        Ok(registration)
    }

    pub async fn set_payment_status(&self, actor: &Actor, uuid: Uuid, status: PaymentStatus) -> Result<(), AppError> {
        if !actor.is_staff() {
            return Err(AppError::Forbidden("only staff may change payment status".to_string()));
        }

        let registration = self
            .store
            .registration(uuid)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("registration {}", uuid)))?;
        let course = self
            .store
            .course(registration.course_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("course {}", registration.course_id)))?;
        if course.school_id != actor.school_id {
            return Err(AppError::Forbidden(format!("registration {} belongs to another school", uuid)));
        }

        self.store.set_payment_status(uuid, status).await?;
        info!("Registration {} payment is now {}", uuid, status);
        Ok(())
    }
}
