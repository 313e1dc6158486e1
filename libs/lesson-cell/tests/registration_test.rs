mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use uuid::Uuid;

use common::{course, teacher};
use lesson_cell::{
    LessonStore, MemoryLessonStore, NewRegistration, PaymentStatus, RegistrationService,
};
use shared_models::AppError;
use shared_utils::test_utils::{date, TestUser};

struct TestSetup {
    store: Arc<MemoryLessonStore>,
    service: RegistrationService,
    school_id: Uuid,
}

impl TestSetup {
    fn new() -> Self {
        let store = Arc::new(MemoryLessonStore::new());
        let service = RegistrationService::new(store.clone());
        Self {
            store,
            service,
            school_id: Uuid::new_v4(),
        }
    }

    fn request(&self, course_id: Uuid, teacher_id: Option<Uuid>) -> NewRegistration {
        NewRegistration {
            student_id: Uuid::new_v4(),
            course_id,
            teacher_id,
            registered_date: date(2024, 1, 31),
            lessons_override: None,
            payment_status: PaymentStatus::Waiting,
        }
    }
}

#[tokio::test]
async fn test_private_registration_takes_course_terms() {
    let setup = TestSetup::new();
    let mut piano = course(setup.school_id, "Piano", false, 1);
    piano.no_exp = false;
    piano.exp_range = 3;
    let instructor = teacher(setup.school_id, &[piano.id]);
    setup.store.put_course(piano.clone()).await;
    setup.store.put_teacher(instructor.clone()).await;

    let registration = setup
        .service
        .register(&TestUser::manager(setup.school_id), setup.request(piano.id, Some(instructor.id)))
        .await
        .unwrap();

    assert_eq!(registration.teacher_id, Some(instructor.id));
    assert_eq!(registration.lessons_left, 10);
    // Month arithmetic clamps to the end of a shorter month.
    assert_eq!(registration.exp_date, Some(date(2024, 4, 30)));
    assert_eq!(registration.payment_status, PaymentStatus::Waiting);

    let stored = setup.store.registration(registration.uuid).await.unwrap();
    assert_eq!(stored, Some(registration));
}

#[tokio::test]
async fn test_group_registration_has_no_teacher() {
    let setup = TestSetup::new();
    let choir = course(setup.school_id, "Choir", true, 8);
    setup.store.put_course(choir.clone()).await;

    let mut request = setup.request(choir.id, Some(Uuid::new_v4()));
    request.lessons_override = Some(4);

    let registration = setup
        .service
        .register(&TestUser::admin(setup.school_id), request)
        .await
        .unwrap();

    assert_eq!(registration.teacher_id, None);
    assert_eq!(registration.lessons_left, 4);
    assert_eq!(registration.exp_date, None);
}

#[tokio::test]
async fn test_private_registration_needs_a_qualified_teacher() {
    let setup = TestSetup::new();
    let manager = TestUser::manager(setup.school_id);
    let piano = course(setup.school_id, "Piano", false, 1);
    let other = teacher(setup.school_id, &[]);
    setup.store.put_course(piano.clone()).await;
    setup.store.put_teacher(other.clone()).await;

    assert_matches!(
        setup.service.register(&manager, setup.request(piano.id, None)).await,
        Err(AppError::Validation(msg)) if msg.contains("needs a teacher")
    );
    assert_matches!(
        setup.service.register(&manager, setup.request(piano.id, Some(other.id))).await,
        Err(AppError::Validation(msg)) if msg.contains("does not teach")
    );
    assert_matches!(
        setup.service.register(&manager, setup.request(piano.id, Some(Uuid::new_v4()))).await,
        Err(AppError::NotFound(_))
    );
}

#[tokio::test]
async fn test_registration_is_staff_only() {
    let setup = TestSetup::new();
    let piano = course(setup.school_id, "Piano", false, 1);
    setup.store.put_course(piano.clone()).await;

    let student = TestUser::student(Uuid::new_v4(), setup.school_id);
    assert_matches!(
        setup.service.register(&student, setup.request(piano.id, None)).await,
        Err(AppError::Forbidden(_))
    );

    let outsider = TestUser::manager(Uuid::new_v4());
    assert_matches!(
        setup.service.register(&outsider, setup.request(piano.id, None)).await,
        Err(AppError::Forbidden(_))
    );
}

#[tokio::test]
async fn test_payment_status_update() {
    let setup = TestSetup::new();
    let manager = TestUser::manager(setup.school_id);
    let choir = course(setup.school_id, "Choir", true, 8);
    setup.store.put_course(choir.clone()).await;

    let registration = setup
        .service
        .register(&manager, setup.request(choir.id, None))
        .await
        .unwrap();

    setup
        .service
        .set_payment_status(&manager, registration.uuid, PaymentStatus::Confirm)
        .await
        .unwrap();
    let stored = setup.store.registration(registration.uuid).await.unwrap().unwrap();
    assert_eq!(stored.payment_status, PaymentStatus::Confirm);

    assert_matches!(
        setup
            .service
            .set_payment_status(&manager, Uuid::new_v4(), PaymentStatus::Denied)
            .await,
        Err(AppError::NotFound(_))
    );
    assert_matches!(
        setup
            .service
            .set_payment_status(
                &TestUser::student(registration.student_id, setup.school_id),
                registration.uuid,
                PaymentStatus::Denied
            )
            .await,
        Err(AppError::Forbidden(_))
    );
}
